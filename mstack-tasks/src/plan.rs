//! Reconciliation plans.
//!
//! A [`Plan`] is the list of [`Stage`]s a component owns, in converge order.
//! Both step sequences are derived from it: converging walks the stages
//! forward and applies each object (then waits on it if the stage asks to),
//! tearing down walks them backward and deletes each object. Removal order is
//! therefore always the exact reverse of apply order.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::error::{Operation, ReconcileError, Subject};
use crate::manifests::ManifestError;
use crate::resource::{ManagedResource, ResourceKey, ResourceKind};

/// Which way a task drives the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward "present and healthy".
    Converging,
    /// Toward "absent".
    TearingDown,
}

impl Direction {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Direction::Converging
        } else {
            Direction::TearingDown
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Converging => "converging",
            Direction::TearingDown => "tearing down",
        })
    }
}

/// How a stage writes its objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apply {
    /// Write once; later contents are owned by someone else.
    CreateIfAbsent,
    /// Upsert; the task owns the object entirely.
    CreateOrUpdate,
}

impl Apply {
    pub fn verb(self) -> Verb {
        match self {
            Apply::CreateIfAbsent => Verb::CreateIfAbsent,
            Apply::CreateOrUpdate => Verb::CreateOrUpdate,
        }
    }
}

/// Resource client verb of one operation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    CreateIfAbsent,
    CreateOrUpdate,
    WaitUntilReady,
    Delete,
}

impl Verb {
    pub fn is_write(self) -> bool {
        matches!(self, Verb::CreateIfAbsent | Verb::CreateOrUpdate)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verb::CreateIfAbsent => "create-if-absent",
            Verb::CreateOrUpdate => "create-or-update",
            Verb::WaitUntilReady => "wait-until-ready",
            Verb::Delete => "delete",
        })
    }
}

/// Failure to derive an object from another component's data.
#[derive(Debug, Error)]
pub enum DeriveError {
    /// The source object lacks the expected field, or it does not parse.
    #[error("{0}")]
    Malformed(String),

    #[error(transparent)]
    Construction(#[from] ManifestError),
}

pub type DeriveFn =
    Box<dyn Fn(&ManagedResource) -> Result<ManagedResource, DeriveError> + Send + Sync>;

/// Another component's object a stage reads before it can build its own.
#[derive(Debug, Clone)]
pub struct Source {
    pub key: ResourceKey,
    pub label: String,
}

pub(crate) enum Desired {
    /// Built from configuration alone. A construction failure is kept in
    /// place and reported when the sequence reaches this stage.
    Built(Result<Vec<ManagedResource>, ManifestError>),
    /// Built at execution time from a sibling's stored object.
    Derived {
        source: Source,
        target: ResourceKey,
        derive: DeriveFn,
    },
}

/// One logical resource (or list of resources of one kind) in a plan.
pub struct Stage {
    pub(crate) kind: ResourceKind,
    pub(crate) label: String,
    pub(crate) apply: Apply,
    pub(crate) await_ready: bool,
    pub(crate) precondition: Result<(), ManifestError>,
    pub(crate) desired: Desired,
}

impl Stage {
    fn built(
        kind: ResourceKind,
        label: impl Into<String>,
        apply: Apply,
        desired: Result<Vec<ManagedResource>, ManifestError>,
    ) -> Self {
        Self {
            kind,
            label: label.into(),
            apply,
            await_ready: false,
            precondition: Ok(()),
            desired: Desired::Built(desired),
        }
    }

    /// A task-owned object, written with `CreateOrUpdate`.
    pub fn upsert(
        kind: ResourceKind,
        label: impl Into<String>,
        desired: Result<ManagedResource, ManifestError>,
    ) -> Self {
        Self::built(kind, label, Apply::CreateOrUpdate, desired.map(|r| vec![r]))
    }

    /// A list of task-owned objects of one kind.
    pub fn upsert_each(
        kind: ResourceKind,
        label: impl Into<String>,
        desired: Result<Vec<ManagedResource>, ManifestError>,
    ) -> Self {
        Self::built(kind, label, Apply::CreateOrUpdate, desired)
    }

    /// An object only written when absent, e.g. a generated secret.
    pub fn create_once(
        kind: ResourceKind,
        label: impl Into<String>,
        desired: Result<ManagedResource, ManifestError>,
    ) -> Self {
        Self::built(kind, label, Apply::CreateIfAbsent, desired.map(|r| vec![r]))
    }

    /// An object built from another component's stored object.
    pub fn derived(
        target: ResourceKey,
        label: impl Into<String>,
        apply: Apply,
        source: Source,
        derive: DeriveFn,
    ) -> Self {
        Self {
            kind: target.kind,
            label: label.into(),
            apply,
            await_ready: false,
            precondition: Ok(()),
            desired: Desired::Derived {
                source,
                target,
                derive,
            },
        }
    }

    /// Block after the write until the store reports the objects ready.
    pub fn await_ready(mut self) -> Self {
        self.await_ready = true;
        self
    }

    /// Refuse to write the stage's objects while `precondition` fails.
    /// Teardown still deletes them.
    pub fn requires(mut self, precondition: Result<(), ManifestError>) -> Self {
        self.precondition = precondition;
        self
    }

    fn targets(&self) -> Vec<Target<'_>> {
        match &self.desired {
            Desired::Built(Ok(list)) => list.iter().map(Target::Built).collect(),
            Desired::Built(Err(e)) => vec![Target::Unbuilt(e)],
            Desired::Derived {
                source,
                target,
                derive,
            } => vec![Target::Derived {
                source,
                key: target,
                derive,
            }],
        }
    }

    /// Objects built from configuration, if any.
    pub fn resources(&self) -> &[ManagedResource] {
        match &self.desired {
            Desired::Built(Ok(list)) => list,
            _ => &[],
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desired = match &self.desired {
            Desired::Built(Ok(list)) => format!("{} object(s)", list.len()),
            Desired::Built(Err(e)) => format!("unbuilt ({})", e),
            Desired::Derived { source, target, .. } => {
                format!("{} derived from {}", target, source.key)
            }
        };
        f.debug_struct("Stage")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("apply", &self.apply)
            .field("await_ready", &self.await_ready)
            .field("precondition", &self.precondition)
            .field("desired", &desired)
            .finish()
    }
}

/// The object a scheduled step targets.
#[derive(Clone, Copy)]
pub(crate) enum Target<'a> {
    Built(&'a ManagedResource),
    Unbuilt(&'a ManifestError),
    Derived {
        source: &'a Source,
        key: &'a ResourceKey,
        derive: &'a DeriveFn,
    },
}

/// One step of a derived sequence, still pointing into its stage.
pub(crate) struct Scheduled<'a> {
    pub stage: &'a Stage,
    pub verb: Verb,
    pub target: Target<'a>,
}

impl<'a> Scheduled<'a> {
    /// Key of the targeted object, or the construction error that kept it
    /// from being built.
    pub fn key(&self) -> Result<&'a ResourceKey, &'a ManifestError> {
        match self.target {
            Target::Built(r) => Ok(&r.key),
            Target::Unbuilt(e) => Err(e),
            Target::Derived { key, .. } => Ok(key),
        }
    }

    pub fn subject(&self) -> Subject {
        Subject::new(
            self.stage.kind,
            self.stage.label.clone(),
            self.key().ok().map(|k| k.name.clone()),
        )
    }
}

/// A verb applied to one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStep {
    pub verb: Verb,
    pub subject: Subject,
    /// `None` if the object could not be built.
    pub key: Option<ResourceKey>,
}

impl fmt::Display for OperationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{} {} ({})", self.verb, key, self.subject.label),
            None => write!(f, "{} {} (unbuilt)", self.verb, self.subject),
        }
    }
}

/// Ordered steps of one direction of one component.
#[derive(Debug, Clone)]
pub struct StepSequence {
    pub direction: Direction,
    pub steps: Vec<OperationStep>,
}

impl StepSequence {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationStep> {
        self.steps.iter()
    }
}

/// All stages of one component, in converge order.
#[derive(Debug)]
pub struct Plan {
    component: &'static str,
    stages: Vec<Stage>,
}

impl Plan {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub(crate) fn schedule(&self, direction: Direction) -> Vec<Scheduled<'_>> {
        let mut out = Vec::new();
        match direction {
            Direction::Converging => {
                for stage in &self.stages {
                    let targets = stage.targets();
                    for target in &targets {
                        out.push(Scheduled {
                            stage,
                            verb: stage.apply.verb(),
                            target: *target,
                        });
                    }
                    if stage.await_ready {
                        // Nothing to wait on if the object was never built.
                        for target in targets {
                            if !matches!(target, Target::Unbuilt(_)) {
                                out.push(Scheduled {
                                    stage,
                                    verb: Verb::WaitUntilReady,
                                    target,
                                });
                            }
                        }
                    }
                }
            }
            Direction::TearingDown => {
                for stage in self.stages.iter().rev() {
                    for target in stage.targets().into_iter().rev() {
                        out.push(Scheduled {
                            stage,
                            verb: Verb::Delete,
                            target,
                        });
                    }
                }
            }
        }
        out
    }

    /// The operation steps a task runs in `direction`.
    pub fn sequence(&self, direction: Direction) -> StepSequence {
        StepSequence {
            direction,
            steps: self
                .schedule(direction)
                .iter()
                .map(|s| OperationStep {
                    verb: s.verb,
                    subject: s.subject(),
                    key: s.key().ok().cloned(),
                })
                .collect(),
        }
    }

    /// Verify every referenced object in this plan is written before the
    /// object referencing it.
    ///
    /// Derived objects only exist at execution time; the executor checks them
    /// with `check_written_before` once they are built.
    pub fn check_order(&self) -> Result<(), ReconcileError> {
        let written = written_at(&self.schedule(Direction::Converging));
        for stage in &self.stages {
            for resource in stage.resources() {
                if let Some(&at) = written.get(&resource.key) {
                    check_written_before(stage, resource, at, &written)?;
                }
            }
        }
        Ok(())
    }
}

/// Index of the first write of every object in `steps`.
pub(crate) fn written_at<'a>(steps: &[Scheduled<'a>]) -> HashMap<&'a ResourceKey, usize> {
    let mut written = HashMap::new();
    for (i, s) in steps.iter().enumerate() {
        if s.verb.is_write() {
            if let Ok(key) = s.key() {
                written.entry(key).or_insert(i);
            }
        }
    }
    written
}

/// Fail if `resource`, written at step `at`, references an object written
/// after it. References to objects outside `written` are not checked.
pub(crate) fn check_written_before(
    stage: &Stage,
    resource: &ManagedResource,
    at: usize,
    written: &HashMap<&ResourceKey, usize>,
) -> Result<(), ReconcileError> {
    for dep in &resource.depends_on {
        if written.get(dep).is_some_and(|&d| d > at) {
            return Err(ReconcileError::new(
                Operation::Initializing,
                Subject::new(
                    resource.kind(),
                    stage.label.clone(),
                    Some(resource.name().to_string()),
                ),
                ManifestError::DependencyOrder {
                    dependent: resource.key.clone(),
                    dependency: dep.clone(),
                },
            ));
        }
    }
    Ok(())
}
