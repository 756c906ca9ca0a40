//! Monitoring stack configuration consumed by the manifest factory.

use serde::{Deserialize, Serialize};

/// Desired configuration of the whole monitoring stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    /// Namespace of the platform monitoring components.
    pub namespace: String,
    /// Namespace of the user workload monitoring components.
    pub user_workload_namespace: String,
    pub images: Images,
    pub grafana: GrafanaConfig,
    pub thanos_querier: ThanosQuerierConfig,
    pub user_workload: UserWorkloadConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            namespace: "monitoring".to_string(),
            user_workload_namespace: "user-workload-monitoring".to_string(),
            images: Images::default(),
            grafana: GrafanaConfig::default(),
            thanos_querier: ThanosQuerierConfig::default(),
            user_workload: UserWorkloadConfig::default(),
        }
    }
}

/// Container images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Images {
    pub thanos: String,
    pub prometheus: String,
    pub grafana: String,
    pub oauth_proxy: String,
    pub kube_rbac_proxy: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            thanos: "quay.io/thanos/thanos:v0.34.1".to_string(),
            prometheus: "quay.io/prometheus/prometheus:v2.51.2".to_string(),
            grafana: "docker.io/grafana/grafana:10.4.2".to_string(),
            oauth_proxy: "quay.io/oauth2-proxy/oauth2-proxy:v7.6.0".to_string(),
            kube_rbac_proxy: "quay.io/brancz/kube-rbac-proxy:v0.17.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrafanaConfig {
    pub enabled: bool,
}

impl Default for GrafanaConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThanosQuerierConfig {
    pub enabled: bool,
    pub replicas: u32,
    pub log_level: String,
}

impl Default for ThanosQuerierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            replicas: 2,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserWorkloadConfig {
    pub enabled: bool,
    pub replicas: u32,
    pub retention: String,
    /// Extra namespaces the user workload Prometheus may scrape, besides its
    /// own namespace.
    pub namespaces: Vec<String>,
}

impl Default for UserWorkloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            replicas: 2,
            retention: "24h".to_string(),
            namespaces: Vec::new(),
        }
    }
}
