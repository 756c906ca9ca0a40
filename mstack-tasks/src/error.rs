//! Reconciliation errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::client::{ClientError, WaitError};
use crate::manifests::ManifestError;
use crate::resource::{ResourceKey, ResourceKind};

/// What the task was attempting when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Building the desired object from configuration.
    Initializing,
    /// `CreateIfAbsent`.
    Creating,
    /// `CreateOrUpdate`.
    Reconciling,
    /// `WaitUntilReady`.
    WaitingFor,
    /// `Delete`.
    Deleting,
    /// Reading another component's object.
    Retrieving,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Initializing => "initializing",
            Operation::Creating => "creating",
            Operation::Reconciling => "reconciling",
            Operation::WaitingFor => "waiting for",
            Operation::Deleting => "deleting",
            Operation::Retrieving => "retrieving",
        })
    }
}

/// The resource an operation was applied to.
///
/// `name` is absent when the object could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub kind: ResourceKind,
    pub label: String,
    pub name: Option<String>,
}

impl Subject {
    pub fn new(kind: ResourceKind, label: impl Into<String>, name: Option<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            name,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label, self.kind)?;
        if let Some(name) = &self.name {
            write!(f, " {:?}", name)?;
        }
        Ok(())
    }
}

/// Underlying reason of a failed step.
#[derive(Debug, Error)]
pub enum Cause {
    #[error(transparent)]
    Construction(#[from] ManifestError),

    #[error(transparent)]
    Operation(#[from] ClientError),

    #[error("not ready after {waited:?}")]
    ReadinessTimeout { waited: Duration },

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("dependency {dependency} not found")]
    DependencyMissing { dependency: ResourceKey },

    #[error("dependency {dependency} is malformed: {reason}")]
    DependencyMalformed {
        dependency: ResourceKey,
        reason: String,
    },
}

impl From<WaitError> for Cause {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout { waited } => Cause::ReadinessTimeout { waited },
            WaitError::Cancelled => Cause::Cancelled,
            WaitError::Client(e) => Cause::Operation(e),
        }
    }
}

/// Failure category, for callers that branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration; the desired object could not be built.
    Construction,
    /// The store rejected a create, update, delete or read.
    Operation,
    ReadinessTimeout,
    Cancelled,
    /// A cross-component source object does not exist yet.
    DependencyMissing,
    /// A cross-component source object exists but lacks usable data.
    DependencyMalformed,
}

/// A failed reconciliation step.
///
/// Steps before the failing one have been applied to the store; none after
/// it were attempted.
#[derive(Debug, Error)]
#[error("{operation} {subject} failed")]
pub struct ReconcileError {
    pub operation: Operation,
    pub subject: Subject,
    #[source]
    pub cause: Cause,
}

impl ReconcileError {
    pub fn new(operation: Operation, subject: Subject, cause: impl Into<Cause>) -> Self {
        Self {
            operation,
            subject,
            cause: cause.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.cause {
            Cause::Construction(_) => ErrorKind::Construction,
            Cause::Operation(_) => ErrorKind::Operation,
            Cause::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Cause::Cancelled => ErrorKind::Cancelled,
            Cause::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            Cause::DependencyMalformed { .. } => ErrorKind::DependencyMalformed,
        }
    }

    /// Message with the underlying cause appended.
    pub fn detailed(&self) -> String {
        format!("{}: {}", self, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_names_operation_and_resource() {
        let err = ReconcileError::new(
            Operation::Reconciling,
            Subject::new(
                ResourceKind::ClusterRoleBinding,
                "Thanos Querier",
                Some("thanos-querier".to_string()),
            ),
            ClientError::Invalid("roleRef is immutable".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "reconciling Thanos Querier ClusterRoleBinding \"thanos-querier\" failed"
        );
        assert_eq!(
            err.detailed(),
            "reconciling Thanos Querier ClusterRoleBinding \"thanos-querier\" failed: invalid: roleRef is immutable"
        );
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_construction_subject_without_name() {
        let err = ReconcileError::new(
            Operation::Initializing,
            Subject::new(ResourceKind::Deployment, "Thanos Querier", None),
            ManifestError::MissingSetting("images.thanos"),
        );
        assert_eq!(
            err.to_string(),
            "initializing Thanos Querier Deployment failed"
        );
        assert_eq!(err.kind(), ErrorKind::Construction);
    }

    #[test]
    fn test_wait_error_mapping() {
        let cause: Cause = WaitError::Timeout {
            waited: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(cause, Cause::ReadinessTimeout { .. }));

        let cause: Cause = WaitError::Cancelled.into();
        assert!(matches!(cause, Cause::Cancelled));

        let cause: Cause = WaitError::Client(ClientError::Unavailable("down".into())).into();
        assert!(matches!(cause, Cause::Operation(_)));
    }
}
