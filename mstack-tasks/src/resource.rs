//! Managed resource model.
//!
//! A [`ManagedResource`] is a complete desired-state snapshot of one object in
//! the remote resource store. The reconciliation core never looks inside the
//! body; it only needs the identity ([`ResourceKey`]) and the declared
//! references to other resources.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource kinds managed by mstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ConfigMap,
    Secret,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    Service,
    Route,
    Deployment,
    Prometheus,
    ServiceMonitor,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
        ResourceKind::ServiceAccount,
        ResourceKind::ClusterRole,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::Service,
        ResourceKind::Route,
        ResourceKind::Deployment,
        ResourceKind::Prometheus,
        ResourceKind::ServiceMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::Service => "Service",
            ResourceKind::Route => "Route",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Prometheus => "Prometheus",
            ResourceKind::ServiceMonitor => "ServiceMonitor",
        }
    }

    /// Cluster-scoped kinds carry no namespace.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding
        )
    }

    /// Kinds whose readiness is reported by the platform after a write.
    ///
    /// Every other kind is ready as soon as it exists.
    pub fn has_readiness(&self) -> bool {
        matches!(
            self,
            ResourceKind::Route | ResourceKind::Deployment | ResourceKind::Prometheus
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// Identity of a resource in the store: (kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: if kind.is_cluster_scoped() {
                None
            } else {
                namespace.map(str::to_string)
            },
            name: name.into(),
        }
    }

    pub fn namespaced(kind: ResourceKind, namespace: &str, name: impl Into<String>) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::new(kind, None, name)
    }

    /// `namespace/name`, or just `name` for cluster-scoped resources.
    pub fn path(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path())
    }
}

/// One object owned by a component, as handed to the resource client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub key: ResourceKey,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Resources this object's body refers to.
    #[serde(default)]
    pub depends_on: Vec<ResourceKey>,
    #[serde(default)]
    pub body: Value,
}

impl ManagedResource {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            depends_on: Vec::new(),
            body: Value::Null,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.key.kind
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.key.namespace.as_deref()
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels
            .extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn depends_on(mut self, key: ResourceKey) -> Self {
        if !self.depends_on.contains(&key) {
            self.depends_on.push(key);
        }
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// String value stored under `stringData.<key>` of a Secret or
    /// `data.<key>` of a ConfigMap.
    pub fn data_field(&self, key: &str) -> Option<&str> {
        self.body
            .get("stringData")
            .or_else(|| self.body.get("data"))
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cluster_scoped_key_drops_namespace() {
        let key = ResourceKey::new(ResourceKind::ClusterRole, Some("monitoring"), "reader");
        assert_eq!(key.namespace, None);
        assert_eq!(key.path(), "reader");

        let key = ResourceKey::namespaced(ResourceKind::Secret, "monitoring", "creds");
        assert_eq!(key.to_string(), "Secret monitoring/creds");
    }

    #[test]
    fn test_kind_parse() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("Pod".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_data_field() {
        let secret = ManagedResource::new(ResourceKey::namespaced(
            ResourceKind::Secret,
            "monitoring",
            "creds",
        ))
        .with_body(json!({ "stringData": { "password": "hunter2" } }));
        assert_eq!(secret.data_field("password"), Some("hunter2"));
        assert_eq!(secret.data_field("user"), None);

        let cm = ManagedResource::new(ResourceKey::namespaced(
            ResourceKind::ConfigMap,
            "monitoring",
            "bundle",
        ))
        .with_body(json!({ "data": { "ca.crt": "" } }));
        assert_eq!(cm.data_field("ca.crt"), Some(""));
    }

    #[test]
    fn test_depends_on_dedup() {
        let sa = ResourceKey::namespaced(ResourceKind::ServiceAccount, "monitoring", "sa");
        let rb = ManagedResource::new(ResourceKey::namespaced(
            ResourceKind::RoleBinding,
            "monitoring",
            "rb",
        ))
        .depends_on(sa.clone())
        .depends_on(sa.clone());
        assert_eq!(rb.depends_on, vec![sa]);
    }
}
