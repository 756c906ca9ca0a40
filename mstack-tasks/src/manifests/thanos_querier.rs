//! Thanos Querier manifests.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::grafana::{BASIC_AUTH_USER, GrafanaDatasources};
use super::{Factory, ManifestError, binding_body, generate_secret, non_empty, replicas, selector};
use crate::plan::DeriveError;
use crate::resource::{ManagedResource, ResourceKey, ResourceKind};

pub const THANOS_QUERIER: &str = "thanos-querier";
/// Key of the htpasswd file inside the htpasswd secret.
pub const HTPASSWD_KEY: &str = "auth";

const OAUTH_COOKIE_SECRET: &str = "thanos-querier-oauth-cookie";
const HTPASSWD_SECRET: &str = "thanos-querier-oauth-htpasswd";
const RBAC_PROXY_SECRET: &str = "thanos-querier-kube-rbac-proxy";

const RBAC_PROXY_CONFIG: &str = r#"authorization:
  resourceAttributes:
    apiVersion: metrics.k8s.io/v1beta1
    resource: pods
"#;

fn htpasswd_line(user: &str, password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    format!("{}:{{SHA256}}{}", user, STANDARD.encode(digest))
}

impl Factory {
    pub fn thanos_querier_service_account(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self.object(
            ResourceKind::ServiceAccount,
            self.namespace()?,
            THANOS_QUERIER,
            THANOS_QUERIER,
        ))
    }

    pub fn thanos_querier_cluster_role(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .cluster_object(ResourceKind::ClusterRole, THANOS_QUERIER, THANOS_QUERIER)
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
                    {
                        "apiGroups": [""],
                        "resources": ["namespaces"],
                        "verbs": ["get"],
                    },
                ],
            })))
    }

    pub fn thanos_querier_cluster_role_binding(&self) -> Result<ManagedResource, ManifestError> {
        let role = ResourceKey::cluster(ResourceKind::ClusterRole, THANOS_QUERIER);
        let sa = self.thanos_querier_service_account()?.key;
        Ok(self
            .cluster_object(ResourceKind::ClusterRoleBinding, THANOS_QUERIER, THANOS_QUERIER)
            .with_body(binding_body(&role, &sa))
            .depends_on(role)
            .depends_on(sa))
    }

    pub fn thanos_querier_service(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .object(
                ResourceKind::Service,
                self.namespace()?,
                THANOS_QUERIER,
                THANOS_QUERIER,
            )
            .with_body(json!({
                "selector": selector(THANOS_QUERIER),
                "ports": [
                    { "name": "web", "port": 9091, "targetPort": "web" },
                    { "name": "tenancy", "port": 9092, "targetPort": "tenancy" },
                ],
            })))
    }

    pub fn thanos_querier_route(&self) -> Result<ManagedResource, ManifestError> {
        let service = self.thanos_querier_service()?.key;
        Ok(self
            .object(
                ResourceKind::Route,
                self.namespace()?,
                THANOS_QUERIER,
                THANOS_QUERIER,
            )
            .with_body(json!({
                "path": "/api",
                "to": { "kind": "Service", "name": service.name },
                "port": { "targetPort": "web" },
                "tls": { "termination": "reencrypt" },
            }))
            .depends_on(service))
    }

    pub fn thanos_querier_oauth_cookie_secret(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .object(
                ResourceKind::Secret,
                self.namespace()?,
                OAUTH_COOKIE_SECRET,
                THANOS_QUERIER,
            )
            .with_body(json!({
                "type": "Opaque",
                "stringData": { "session_secret": generate_secret(43) },
            })))
    }

    pub fn thanos_querier_htpasswd_secret_key(&self) -> Result<ResourceKey, ManifestError> {
        Ok(ResourceKey::namespaced(
            ResourceKind::Secret,
            self.namespace()?,
            HTPASSWD_SECRET,
        ))
    }

    /// The htpasswd secret is derived from Grafana's datasources secret,
    /// which only exists while Grafana is enabled.
    pub fn thanos_querier_requires_grafana(&self) -> Result<(), ManifestError> {
        if self.config().grafana.enabled {
            Ok(())
        } else {
            Err(ManifestError::RequiresComponent {
                component: "thanosQuerier",
                dependency: "grafana",
            })
        }
    }

    /// htpasswd secret granting Grafana's basic-auth user access.
    pub fn thanos_querier_htpasswd_secret(
        &self,
        password: &str,
    ) -> Result<ManagedResource, ManifestError> {
        if password.is_empty() {
            return Err(ManifestError::InvalidSetting {
                setting: "grafana basic auth password",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(self
            .object(
                ResourceKind::Secret,
                self.namespace()?,
                HTPASSWD_SECRET,
                THANOS_QUERIER,
            )
            .with_body(json!({
                "type": "Opaque",
                "stringData": { HTPASSWD_KEY: htpasswd_line(BASIC_AUTH_USER, password) },
            })))
    }

    /// htpasswd secret built from the password in Grafana's stored
    /// datasources secret.
    pub fn thanos_querier_htpasswd_secret_from(
        &self,
        datasources: &ManagedResource,
    ) -> Result<ManagedResource, DeriveError> {
        let doc = GrafanaDatasources::from_secret(datasources)?;
        let password = doc.basic_auth_password()?;
        Ok(self.thanos_querier_htpasswd_secret(password)?)
    }

    pub fn thanos_querier_rbac_proxy_secret(&self) -> Result<ManagedResource, ManifestError> {
        Ok(self
            .object(
                ResourceKind::Secret,
                self.namespace()?,
                RBAC_PROXY_SECRET,
                THANOS_QUERIER,
            )
            .with_body(json!({
                "type": "Opaque",
                "stringData": { "config.yaml": RBAC_PROXY_CONFIG },
            })))
    }

    pub fn thanos_querier_deployment(&self) -> Result<ManagedResource, ManifestError> {
        let config = self.config();
        let ns = self.namespace()?;
        let thanos = non_empty("images.thanos", &config.images.thanos)?;
        let oauth_proxy = non_empty("images.oauthProxy", &config.images.oauth_proxy)?;
        let rbac_proxy = non_empty("images.kubeRbacProxy", &config.images.kube_rbac_proxy)?;
        let replicas = replicas("thanosQuerier.replicas", config.thanos_querier.replicas)?;

        let mut stores = vec![format!(
            "--store=dnssrv+_grpc._tcp.prometheus-operated.{}.svc.cluster.local",
            ns
        )];
        if config.user_workload.enabled {
            stores.push(format!(
                "--store=dnssrv+_grpc._tcp.prometheus-operated.{}.svc.cluster.local",
                self.user_workload_namespace()?
            ));
        }
        let mut args = vec![
            "query".to_string(),
            "--grpc-address=127.0.0.1:10901".to_string(),
            "--http-address=127.0.0.1:9090".to_string(),
            format!("--log.level={}", config.thanos_querier.log_level),
            "--query.replica-label=prometheus_replica".to_string(),
        ];
        args.extend(stores);

        let sa = self.thanos_querier_service_account()?.key;
        let cookie = ResourceKey::namespaced(ResourceKind::Secret, ns, OAUTH_COOKIE_SECRET);
        let htpasswd = self.thanos_querier_htpasswd_secret_key()?;
        let rbac = ResourceKey::namespaced(ResourceKind::Secret, ns, RBAC_PROXY_SECRET);

        Ok(self
            .object(ResourceKind::Deployment, ns, THANOS_QUERIER, THANOS_QUERIER)
            .with_body(json!({
                "replicas": replicas,
                "selector": { "matchLabels": selector(THANOS_QUERIER) },
                "template": {
                    "serviceAccountName": sa.name,
                    "containers": [
                        {
                            "name": "thanos-query",
                            "image": thanos,
                            "args": args,
                        },
                        {
                            "name": "oauth-proxy",
                            "image": oauth_proxy,
                            "args": [
                                "--https-address=:9091",
                                "--htpasswd-file=/etc/proxy/htpasswd/auth",
                                "--cookie-secret-file=/etc/proxy/secrets/session_secret",
                                "--upstream=http://localhost:9090",
                            ],
                            "ports": [{ "name": "web", "containerPort": 9091 }],
                        },
                        {
                            "name": "kube-rbac-proxy",
                            "image": rbac_proxy,
                            "args": [
                                "--secure-listen-address=0.0.0.0:9092",
                                "--upstream=http://127.0.0.1:9090",
                                "--config-file=/etc/kube-rbac-proxy/config.yaml",
                            ],
                            "ports": [{ "name": "tenancy", "containerPort": 9092 }],
                        },
                    ],
                    "volumes": [
                        { "name": "secret-cookie", "secret": { "secretName": cookie.name } },
                        { "name": "secret-htpasswd", "secret": { "secretName": htpasswd.name } },
                        { "name": "secret-rbac-proxy", "secret": { "secretName": rbac.name } },
                    ],
                },
            }))
            .depends_on(sa)
            .depends_on(cookie)
            .depends_on(htpasswd)
            .depends_on(rbac))
    }

    pub fn thanos_querier_service_monitor(&self) -> Result<ManagedResource, ManifestError> {
        let service = self.thanos_querier_service()?.key;
        let deployment = ResourceKey::namespaced(
            ResourceKind::Deployment,
            self.namespace()?,
            THANOS_QUERIER,
        );
        Ok(self
            .object(
                ResourceKind::ServiceMonitor,
                self.namespace()?,
                THANOS_QUERIER,
                THANOS_QUERIER,
            )
            .with_body(json!({
                "selector": { "matchLabels": selector(THANOS_QUERIER) },
                "endpoints": [{ "port": "tenancy", "scheme": "https", "interval": "30s" }],
            }))
            .depends_on(service)
            .depends_on(deployment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifests::{MonitoringConfig, UserWorkloadConfig};

    #[test]
    fn test_htpasswd_from_datasources() {
        let factory = Factory::new(MonitoringConfig::default());
        let datasources = factory.grafana_datasources().unwrap();
        let password = GrafanaDatasources::from_secret(&datasources)
            .unwrap()
            .basic_auth_password()
            .unwrap()
            .to_string();

        let secret = factory
            .thanos_querier_htpasswd_secret_from(&datasources)
            .unwrap();
        assert_eq!(
            secret.key,
            factory.thanos_querier_htpasswd_secret_key().unwrap()
        );
        assert_eq!(
            secret.data_field(HTPASSWD_KEY).unwrap(),
            htpasswd_line("internal", &password)
        );
    }

    #[test]
    fn test_htpasswd_is_deterministic() {
        let factory = Factory::new(MonitoringConfig::default());
        assert_eq!(
            factory.thanos_querier_htpasswd_secret("pw").unwrap(),
            factory.thanos_querier_htpasswd_secret("pw").unwrap()
        );
    }

    #[test]
    fn test_requires_grafana() {
        let mut config = MonitoringConfig::default();
        assert!(Factory::new(config.clone()).thanos_querier_requires_grafana().is_ok());

        config.grafana.enabled = false;
        let err = Factory::new(config)
            .thanos_querier_requires_grafana()
            .unwrap_err();
        assert_eq!(err.to_string(), "thanosQuerier requires grafana to be enabled");
    }

    #[test]
    fn test_htpasswd_line_format() {
        // sha256("secret"), base64 encoded
        assert_eq!(
            htpasswd_line("internal", "secret"),
            "internal:{SHA256}K7gNU3sdo+OL0wNhqoVWhr3g6s1xYv72ol/pe/Unols="
        );
    }

    #[test]
    fn test_deployment_requires_images() {
        let mut config = MonitoringConfig::default();
        config.images.oauth_proxy = String::new();
        let err = Factory::new(config).thanos_querier_deployment().unwrap_err();
        assert_eq!(err, ManifestError::MissingSetting("images.oauthProxy"));
    }

    #[test]
    fn test_deployment_adds_user_workload_store() {
        let config = MonitoringConfig {
            user_workload: UserWorkloadConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let deployment = Factory::new(config).thanos_querier_deployment().unwrap();
        let args = deployment.body["template"]["containers"][0]["args"]
            .as_array()
            .unwrap();
        assert!(
            args.iter()
                .any(|a| a.as_str().unwrap().contains("user-workload-monitoring"))
        );
    }
}
