//! mstack reconciliation tasks.
//!
//! Each monitoring component is a [`Task`] that drives its objects in a
//! resource store toward one of two states: present and ready while the
//! component is enabled, absent once it is disabled. Steps run strictly in
//! order and the first failure aborts the run with a [`ReconcileError`]
//! naming the operation and the resource. Every step is idempotent, so a
//! failed run is simply retried.

pub mod client;
pub mod components;
pub mod error;
pub mod executor;
pub mod manifests;
pub mod memory;
pub mod plan;
pub mod resource;
pub mod shutdown;
pub mod task;

pub use client::{ClientError, ResourceClient, WaitBudget, WaitError};
pub use error::{Cause, ErrorKind, Operation, ReconcileError, Subject};
pub use executor::{Executor, WaitPolicy};
pub use manifests::{Factory, ManifestError, MonitoringConfig};
pub use memory::MemoryClient;
pub use plan::{Direction, OperationStep, Plan, Stage, StepSequence, Verb};
pub use resource::{ManagedResource, ResourceKey, ResourceKind};
pub use shutdown::Shutdown;
pub use task::{Component, ComponentTask, SharedConfig, Task};
