//! Grafana manifests and the datasources secret other components read.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    Factory, ManifestError, binding_body, generate_secret, non_empty, selector,
    thanos_querier::THANOS_QUERIER,
};
use crate::plan::DeriveError;
use crate::resource::{ManagedResource, ResourceKey, ResourceKind};

pub const GRAFANA: &str = "grafana";
pub const GRAFANA_DATASOURCES_SECRET: &str = "grafana-datasources";
/// Key of the datasources document inside the secret.
pub const DATASOURCES_KEY: &str = "prometheus.yaml";
/// Basic-auth user Grafana presents to the querier.
pub const BASIC_AUTH_USER: &str = "internal";

/// Grafana datasource provisioning document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaDatasources {
    pub api_version: u32,
    pub datasources: Vec<Datasource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub access: String,
    pub url: String,
    #[serde(default)]
    pub basic_auth: bool,
    #[serde(default)]
    pub basic_auth_user: String,
    #[serde(default)]
    pub basic_auth_password: String,
}

impl GrafanaDatasources {
    /// Parse the document stored in the datasources secret.
    pub fn from_secret(secret: &ManagedResource) -> Result<Self, DeriveError> {
        let raw = secret.data_field(DATASOURCES_KEY).ok_or_else(|| {
            DeriveError::Malformed(format!("key {:?} not present", DATASOURCES_KEY))
        })?;
        serde_json::from_str(raw)
            .map_err(|e| DeriveError::Malformed(format!("key {:?}: {}", DATASOURCES_KEY, e)))
    }

    /// Basic-auth password of the first datasource.
    pub fn basic_auth_password(&self) -> Result<&str, DeriveError> {
        let ds = self
            .datasources
            .first()
            .ok_or_else(|| DeriveError::Malformed("no datasources defined".to_string()))?;
        if ds.basic_auth_password.is_empty() {
            return Err(DeriveError::Malformed(format!(
                "datasource {:?} has no basic auth password",
                ds.name
            )));
        }
        Ok(&ds.basic_auth_password)
    }
}

impl Factory {
    pub fn grafana_datasources_key(&self) -> Result<ResourceKey, ManifestError> {
        Ok(ResourceKey::namespaced(
            ResourceKind::Secret,
            self.namespace()?,
            GRAFANA_DATASOURCES_SECRET,
        ))
    }

    /// Datasources secret with a freshly generated basic-auth password.
    pub fn grafana_datasources(&self) -> Result<ManagedResource, ManifestError> {
        let ns = self.namespace()?;
        let doc = GrafanaDatasources {
            api_version: 1,
            datasources: vec![Datasource {
                name: "prometheus".to_string(),
                kind: "prometheus".to_string(),
                access: "proxy".to_string(),
                url: format!("https://{}.{}.svc:9091", THANOS_QUERIER, ns),
                basic_auth: true,
                basic_auth_user: BASIC_AUTH_USER.to_string(),
                basic_auth_password: generate_secret(32),
            }],
        };
        let doc = serde_json::to_string_pretty(&doc).map_err(|e| ManifestError::InvalidSetting {
            setting: "grafana",
            reason: e.to_string(),
        })?;

        Ok(self
            .object(ResourceKind::Secret, ns, GRAFANA_DATASOURCES_SECRET, GRAFANA)
            .with_body(json!({
                "type": "Opaque",
                "stringData": { DATASOURCES_KEY: doc },
            })))
    }

    pub fn grafana_service_account(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self.object(ResourceKind::ServiceAccount, self.namespace()?, GRAFANA, GRAFANA))
    }

    pub fn grafana_cluster_role(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .cluster_object(ResourceKind::ClusterRole, GRAFANA, GRAFANA)
            .with_body(json!({
                "rules": [
                    {
                        "apiGroups": ["authentication.k8s.io"],
                        "resources": ["tokenreviews"],
                        "verbs": ["create"],
                    },
                    {
                        "apiGroups": ["authorization.k8s.io"],
                        "resources": ["subjectaccessreviews"],
                        "verbs": ["create"],
                    },
                ],
            })))
    }

    pub fn grafana_cluster_role_binding(&self) -> Result<ManagedResource, ManifestError> {
        let role = ResourceKey::cluster(ResourceKind::ClusterRole, GRAFANA);
        let sa = self.grafana_service_account()?.key;
        Ok(self
            .cluster_object(ResourceKind::ClusterRoleBinding, GRAFANA, GRAFANA)
            .with_body(binding_body(&role, &sa))
            .depends_on(role)
            .depends_on(sa))
    }

    pub fn grafana_service(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .object(ResourceKind::Service, self.namespace()?, GRAFANA, GRAFANA)
            .with_body(json!({
                "selector": selector(GRAFANA),
                "ports": [{ "name": "https", "port": 3000, "targetPort": "https" }],
            })))
    }

    pub fn grafana_route(&self) -> Result<ManagedResource, ManifestError> {
        let service = self.grafana_service()?.key;
        Ok(self
            .object(ResourceKind::Route, self.namespace()?, GRAFANA, GRAFANA)
            .with_body(json!({
                "to": { "kind": "Service", "name": service.name },
                "port": { "targetPort": "https" },
                "tls": { "termination": "reencrypt" },
            }))
            .depends_on(service))
    }

    pub fn grafana_deployment(&self) -> Result<ManagedResource, ManifestError> {
        let ns = self.namespace()?;
        let image = non_empty("images.grafana", &self.config().images.grafana)?;
        let sa = self.grafana_service_account()?.key;
        let datasources = self.grafana_datasources_key()?;
        Ok(self
            .object(ResourceKind::Deployment, ns, GRAFANA, GRAFANA)
            .with_body(json!({
                "replicas": 1,
                "selector": { "matchLabels": selector(GRAFANA) },
                "template": {
                    "serviceAccountName": sa.name,
                    "containers": [{
                        "name": GRAFANA,
                        "image": image,
                        "ports": [{ "name": "https", "containerPort": 3000 }],
                        "volumeMounts": [{
                            "name": "datasources",
                            "mountPath": "/etc/grafana/provisioning/datasources",
                        }],
                    }],
                    "volumes": [{
                        "name": "datasources",
                        "secret": { "secretName": datasources.name },
                    }],
                },
            }))
            .depends_on(sa)
            .depends_on(datasources))
    }

    pub fn grafana_service_monitor(&self) -> Result<ManagedResource, ManifestError> {
        let service = self.grafana_service()?.key;
        let deployment = self.grafana_deployment()?.key;
        Ok(self
            .object(ResourceKind::ServiceMonitor, self.namespace()?, GRAFANA, GRAFANA)
            .with_body(json!({
                "selector": { "matchLabels": selector(GRAFANA) },
                "endpoints": [{ "port": "https", "scheme": "https", "interval": "30s" }],
            }))
            .depends_on(service)
            .depends_on(deployment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifests::MonitoringConfig;

    #[test]
    fn test_datasources_round_trip_through_secret() {
        let factory = Factory::new(MonitoringConfig::default());
        let secret = factory.grafana_datasources().unwrap();
        let doc = GrafanaDatasources::from_secret(&secret).unwrap();
        assert_eq!(doc.datasources[0].basic_auth_user, BASIC_AUTH_USER);
        assert_eq!(
            doc.datasources[0].url,
            "https://thanos-querier.monitoring.svc:9091"
        );
        assert_eq!(doc.basic_auth_password().unwrap().len(), 32);
    }

    #[test]
    fn test_from_secret_missing_key() {
        let secret = ManagedResource::new(ResourceKey::namespaced(
            ResourceKind::Secret,
            "monitoring",
            GRAFANA_DATASOURCES_SECRET,
        ))
        .with_body(json!({ "stringData": {} }));
        let err = GrafanaDatasources::from_secret(&secret).unwrap_err();
        assert!(err.to_string().contains("not present"));
    }

    #[test]
    fn test_from_secret_unparsable() {
        let secret = ManagedResource::new(ResourceKey::namespaced(
            ResourceKind::Secret,
            "monitoring",
            GRAFANA_DATASOURCES_SECRET,
        ))
        .with_body(json!({ "stringData": { DATASOURCES_KEY: "datasources: [" } }));
        assert!(matches!(
            GrafanaDatasources::from_secret(&secret),
            Err(DeriveError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_datasource_list() {
        let doc = GrafanaDatasources {
            api_version: 1,
            datasources: vec![],
        };
        assert!(matches!(
            doc.basic_auth_password(),
            Err(DeriveError::Malformed(_))
        ));
    }

    #[test]
    fn test_cluster_role_binding_references() {
        let factory = Factory::new(MonitoringConfig::default());
        let crb = factory.grafana_cluster_role_binding().unwrap();
        assert_eq!(crb.namespace(), None);
        assert_eq!(crb.depends_on.len(), 2);
        assert_eq!(crb.body["subjects"][0]["namespace"], "monitoring");
    }
}
