//! Prometheus user workload manifests.

use serde_json::json;

use super::{Factory, ManifestError, binding_body, non_empty, replicas, selector};
use crate::resource::{ManagedResource, ResourceKey, ResourceKind};

const PROMETHEUS_USER_WORKLOAD: &str = "prometheus-user-workload";
const CONFIG_ROLE: &str = "prometheus-user-workload-config";
const SERVING_CERTS_CA_BUNDLE: &str = "serving-certs-ca-bundle";

impl Factory {
    /// Namespaces the user workload Prometheus reads: its own, then every
    /// configured one, without duplicates.
    fn user_workload_namespaces(&self) -> Result<Vec<String>, ManifestError> {
        let mut out = vec![self.user_workload_namespace()?.to_string()];
        for ns in &self.config().user_workload.namespaces {
            let ns = non_empty("userWorkload.namespaces", ns)?;
            if !out.iter().any(|n| n == ns) {
                out.push(ns.to_string());
            }
        }
        Ok(out)
    }

    /// Empty CA bundle ConfigMap, filled in by the platform's certificate
    /// injector.
    pub fn prometheus_user_workload_serving_certs_ca_bundle(
        &self,
    ) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .object(
                ResourceKind::ConfigMap,
                self.user_workload_namespace()?,
                SERVING_CERTS_CA_BUNDLE,
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_labels([("service.beta.openshift.io/inject-cabundle", "true")])
            .with_body(json!({ "data": { "service-ca.crt": "" } })))
    }

    pub fn prometheus_user_workload_service_account(
        &self,
    ) -> Result<ManagedResource, ManifestError> {
        Ok(self.object(
            ResourceKind::ServiceAccount,
            self.user_workload_namespace()?,
            PROMETHEUS_USER_WORKLOAD,
            PROMETHEUS_USER_WORKLOAD,
        ))
    }

    pub fn prometheus_user_workload_cluster_role(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .cluster_object(
                ResourceKind::ClusterRole,
                PROMETHEUS_USER_WORKLOAD,
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_body(json!({
                "rules": [
                    {
                        "apiGroups": [""],
                        "resources": ["namespaces"],
                        "verbs": ["get"],
                    },
                    {
                        "nonResourceURLs": ["/metrics"],
                        "verbs": ["get"],
                    },
                ],
            })))
    }

    pub fn prometheus_user_workload_cluster_role_binding(
        &self,
    ) -> Result<ManagedResource, ManifestError> {
        let role = ResourceKey::cluster(ResourceKind::ClusterRole, PROMETHEUS_USER_WORKLOAD);
        let sa = self.prometheus_user_workload_service_account()?.key;
        Ok(self
            .cluster_object(
                ResourceKind::ClusterRoleBinding,
                PROMETHEUS_USER_WORKLOAD,
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_body(binding_body(&role, &sa))
            .depends_on(role)
            .depends_on(sa))
    }

    /// Role letting Prometheus read its own configuration.
    pub fn prometheus_user_workload_role_config(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .object(
                ResourceKind::Role,
                self.user_workload_namespace()?,
                CONFIG_ROLE,
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_body(json!({
                "rules": [{
                    "apiGroups": [""],
                    "resources": ["configmaps"],
                    "verbs": ["get"],
                }],
            })))
    }

    /// One scrape-discovery Role per watched namespace.
    pub fn prometheus_user_workload_role_list(
        &self,
    ) -> Result<Vec<ManagedResource>, ManifestError> {
        Ok(self
            .user_workload_namespaces()?
            .iter()
            .map(|ns| {
                self.object(
                    ResourceKind::Role,
                    ns,
                    PROMETHEUS_USER_WORKLOAD,
                    PROMETHEUS_USER_WORKLOAD,
                )
                .with_body(json!({
                    "rules": [{
                        "apiGroups": [""],
                        "resources": ["services", "endpoints", "pods"],
                        "verbs": ["get", "list", "watch"],
                    }],
                }))
            })
            .collect())
    }

    pub fn prometheus_user_workload_role_binding_list(
        &self,
    ) -> Result<Vec<ManagedResource>, ManifestError> {
        let sa = self.prometheus_user_workload_service_account()?.key;
        Ok(self
            .user_workload_namespaces()?
            .iter()
            .map(|ns| {
                let role =
                    ResourceKey::namespaced(ResourceKind::Role, ns, PROMETHEUS_USER_WORKLOAD);
                self.object(
                    ResourceKind::RoleBinding,
                    ns,
                    PROMETHEUS_USER_WORKLOAD,
                    PROMETHEUS_USER_WORKLOAD,
                )
                .with_body(binding_body(&role, &sa))
                .depends_on(role)
                .depends_on(sa.clone())
            })
            .collect())
    }

    pub fn prometheus_user_workload_role_binding_config(
        &self,
    ) -> Result<ManagedResource, ManifestError> {
        let role = self.prometheus_user_workload_role_config()?.key;
        let sa = self.prometheus_user_workload_service_account()?.key;
        Ok(self
            .object(
                ResourceKind::RoleBinding,
                self.user_workload_namespace()?,
                CONFIG_ROLE,
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_body(binding_body(&role, &sa))
            .depends_on(role)
            .depends_on(sa))
    }

    pub fn prometheus_user_workload_service(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .object(
                ResourceKind::Service,
                self.user_workload_namespace()?,
                PROMETHEUS_USER_WORKLOAD,
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_body(json!({
                "selector": { "prometheus": "user-workload" },
                "ports": [{ "name": "metrics", "port": 9091, "targetPort": "metrics" }],
            })))
    }

    pub fn prometheus_user_workload(&self) -> Result<ManagedResource, ManifestError> {
        let config = self.config();
        let image = non_empty("images.prometheus", &config.images.prometheus)?;
        let replicas = replicas("userWorkload.replicas", config.user_workload.replicas)?;
        let retention = non_empty("userWorkload.retention", &config.user_workload.retention)?;
        let sa = self.prometheus_user_workload_service_account()?.key;
        let ca_bundle = self.prometheus_user_workload_serving_certs_ca_bundle()?.key;
        let config_binding = self.prometheus_user_workload_role_binding_config()?.key;

        Ok(self
            .object(
                ResourceKind::Prometheus,
                self.user_workload_namespace()?,
                "user-workload",
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_body(json!({
                "image": image,
                "replicas": replicas,
                "retention": retention,
                "serviceAccountName": sa.name,
                "configMaps": [ca_bundle.name],
                "serviceMonitorNamespaceSelector": {
                    "matchExpressions": [{
                        "key": "kubernetes.io/metadata.name",
                        "operator": "In",
                        "values": self.user_workload_namespaces()?,
                    }],
                },
                "thanos": { "image": config.images.thanos },
            }))
            .depends_on(sa)
            .depends_on(ca_bundle)
            .depends_on(config_binding))
    }

    pub fn prometheus_user_workload_service_monitor(
        &self,
    ) -> Result<ManagedResource, ManifestError> {
        let service = self.prometheus_user_workload_service()?.key;
        let prometheus = ResourceKey::namespaced(
            ResourceKind::Prometheus,
            self.user_workload_namespace()?,
            "user-workload",
        );
        Ok(self
            .object(
                ResourceKind::ServiceMonitor,
                self.user_workload_namespace()?,
                "prometheus",
                PROMETHEUS_USER_WORKLOAD,
            )
            .with_body(json!({
                "selector": { "matchLabels": selector(PROMETHEUS_USER_WORKLOAD) },
                "endpoints": [{ "port": "metrics", "scheme": "https", "interval": "30s" }],
            }))
            .depends_on(service)
            .depends_on(prometheus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifests::{MonitoringConfig, UserWorkloadConfig};

    fn factory(namespaces: &[&str]) -> Factory {
        Factory::new(MonitoringConfig {
            user_workload: UserWorkloadConfig {
                enabled: true,
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_role_list_covers_each_namespace_once() {
        let roles = factory(&["team-a", "user-workload-monitoring", "team-b"])
            .prometheus_user_workload_role_list()
            .unwrap();
        let namespaces: Vec<_> = roles.iter().map(|r| r.namespace().unwrap()).collect();
        assert_eq!(
            namespaces,
            vec!["user-workload-monitoring", "team-a", "team-b"]
        );
    }

    #[test]
    fn test_role_bindings_follow_roles() {
        let factory = factory(&["team-a"]);
        let roles = factory.prometheus_user_workload_role_list().unwrap();
        let bindings = factory.prometheus_user_workload_role_binding_list().unwrap();
        assert_eq!(roles.len(), bindings.len());
        for (role, binding) in roles.iter().zip(&bindings) {
            assert_eq!(role.namespace(), binding.namespace());
            assert!(binding.depends_on.contains(&role.key));
        }
    }

    #[test]
    fn test_empty_extra_namespace_rejected() {
        let err = factory(&[""])
            .prometheus_user_workload_role_list()
            .unwrap_err();
        assert_eq!(err, ManifestError::MissingSetting("userWorkload.namespaces"));
    }

    #[test]
    fn test_prometheus_object() {
        let prometheus = factory(&[]).prometheus_user_workload().unwrap();
        assert_eq!(prometheus.kind(), ResourceKind::Prometheus);
        assert_eq!(prometheus.body["retention"], "24h");
        assert_eq!(prometheus.body["replicas"], 2);
    }
}
