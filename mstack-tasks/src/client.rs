//! Resource client capability.
//!
//! Implementations talk to a remote resource store and must keep every verb
//! idempotent: a task that failed half-way is retried from the first step.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::resource::{ManagedResource, ResourceKey};
use crate::shutdown::Shutdown;

/// Errors returned by the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Write conflicts with the stored object.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store rejected the object.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The caller is not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The store could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

/// Why a readiness wait ended without the resource becoming ready.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("not ready after {waited:?}")]
    Timeout { waited: Duration },

    #[error("wait cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Bounds of one readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct WaitBudget {
    pub deadline: Instant,
    pub poll_interval: Duration,
}

/// Deadline used when `now + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl WaitBudget {
    pub fn starting_now(timeout: Duration, poll_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            deadline: now
                .checked_add(timeout)
                .unwrap_or_else(|| now + FAR_FUTURE),
            poll_interval,
        }
    }
}

/// Verbs the reconciliation core needs from a resource store.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create the resource unless an object with the same key exists.
    ///
    /// Returns `true` if the resource was created. An existing object is left
    /// untouched, whatever its contents.
    async fn create_if_absent(&self, resource: &ManagedResource) -> Result<bool, ClientError>;

    /// Create the resource or replace the stored object with it.
    async fn create_or_update(&self, resource: &ManagedResource) -> Result<(), ClientError>;

    /// Delete the resource. Deleting an absent resource succeeds.
    async fn delete(&self, key: &ResourceKey) -> Result<(), ClientError>;

    /// Whether the resource exists and the platform reports it converged.
    async fn is_ready(&self, key: &ResourceKey) -> Result<bool, ClientError>;

    /// Read back a stored object, typically another component's secret.
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, ClientError>;

    /// Block until [`is_ready`](Self::is_ready) reports `true`, the budget's
    /// deadline passes, or shutdown is requested.
    async fn wait_until_ready(
        &self,
        key: &ResourceKey,
        budget: WaitBudget,
        mut shutdown: Shutdown,
    ) -> Result<(), WaitError> {
        let start = Instant::now();
        loop {
            if self.is_ready(key).await? {
                debug!(resource = %key, elapsed_ms = start.elapsed().as_millis(), "Resource ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= budget.deadline {
                return Err(WaitError::Timeout {
                    waited: now - start,
                });
            }

            debug!(resource = %key, "Resource not ready yet, polling again");
            let next = (now + budget.poll_interval).min(budget.deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = shutdown.triggered() => return Err(WaitError::Cancelled),
            }
        }
    }
}
