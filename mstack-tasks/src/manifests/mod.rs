//! Manifest factory - builds the desired objects of every component from
//! configuration.
//!
//! Every builder is a pure function of [`MonitoringConfig`], with one
//! exception: generated credentials (random passwords, cookie secrets). Those
//! objects are only ever written with `CreateIfAbsent`, so the first generated
//! value sticks. Objects derived from them are deterministic and upserted.

mod config;
mod grafana;
mod thanos_querier;
mod user_workload;

use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};
use thiserror::Error;

use crate::resource::{ManagedResource, ResourceKey, ResourceKind};

pub use config::{
    GrafanaConfig, Images, MonitoringConfig, ThanosQuerierConfig, UserWorkloadConfig,
};
pub use grafana::{
    BASIC_AUTH_USER, DATASOURCES_KEY, Datasource, GRAFANA_DATASOURCES_SECRET, GrafanaDatasources,
};
pub use thanos_querier::HTPASSWD_KEY;

/// Errors building a desired object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("missing required setting {0}")]
    MissingSetting(&'static str),

    #[error("invalid setting {setting}: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },

    #[error("{component} requires {dependency} to be enabled")]
    RequiresComponent {
        component: &'static str,
        dependency: &'static str,
    },

    #[error("{dependent} is applied before {dependency}")]
    DependencyOrder {
        dependent: ResourceKey,
        dependency: ResourceKey,
    },
}

pub const PART_OF: &str = "mstack";
pub const MANAGED_BY: &str = "mstack-operator";

/// Builds desired objects from one configuration snapshot.
///
/// Cheap to clone; derived stages capture a clone.
#[derive(Debug, Clone)]
pub struct Factory {
    config: Arc<MonitoringConfig>,
}

impl Factory {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    fn namespace(&self) -> Result<&str, ManifestError> {
        non_empty("namespace", &self.config.namespace)
    }

    fn user_workload_namespace(&self) -> Result<&str, ManifestError> {
        non_empty("userWorkloadNamespace", &self.config.user_workload_namespace)
    }

    /// Empty object of `kind` in `namespace` with the common labels for
    /// `app`.
    fn object(&self, kind: ResourceKind, namespace: &str, name: &str, app: &str) -> ManagedResource {
        ManagedResource::new(ResourceKey::new(kind, Some(namespace), name)).with_labels(labels(app))
    }

    fn cluster_object(&self, kind: ResourceKind, name: &str, app: &str) -> ManagedResource {
        ManagedResource::new(ResourceKey::cluster(kind, name)).with_labels(labels(app))
    }
}

fn labels(app: &str) -> [(&'static str, String); 3] {
    [
        ("app.kubernetes.io/name", app.to_string()),
        ("app.kubernetes.io/part-of", PART_OF.to_string()),
        ("app.kubernetes.io/managed-by", MANAGED_BY.to_string()),
    ]
}

fn non_empty<'a>(setting: &'static str, value: &'a str) -> Result<&'a str, ManifestError> {
    if value.trim().is_empty() {
        Err(ManifestError::MissingSetting(setting))
    } else {
        Ok(value)
    }
}

fn replicas(setting: &'static str, value: u32) -> Result<u32, ManifestError> {
    if value == 0 {
        return Err(ManifestError::InvalidSetting {
            setting,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn generate_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Body of a (Cluster)RoleBinding granting `role` to one service account.
fn binding_body(role: &ResourceKey, subject: &ResourceKey) -> Value {
    json!({
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": role.kind.as_str(),
            "name": role.name,
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": subject.name,
            "namespace": subject.namespace,
        }],
    })
}

fn selector(app: &str) -> Value {
    json!({ "app.kubernetes.io/name": app })
}
