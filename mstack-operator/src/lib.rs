//! mstack operator - drives the monitoring stack tasks against a resource
//! store.

pub mod config;
pub mod operator;
pub mod store;

pub use config::{ConfigError, OperatorConfig, ReadinessConfig};
pub use operator::{Operator, PassError, TaskGroup};
pub use store::{ResourceEntry, SqliteClient};
