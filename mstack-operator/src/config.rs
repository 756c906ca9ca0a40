//! Operator configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mstack_tasks::{Factory, MonitoringConfig, WaitPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound of `readiness.timeoutSecs`.
pub const MAX_READINESS_TIMEOUT_SECS: u64 = 86400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, read from a JSON file. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    pub monitoring: MonitoringConfig,
    /// Pause between passes after a successful pass.
    pub resync_interval_secs: u64,
    /// Pause before the next pass after a failed one.
    pub retry_interval_secs: u64,
    pub readiness: ReadinessConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            monitoring: MonitoringConfig::default(),
            resync_interval_secs: 300,
            retry_interval_secs: 30,
            readiness: ReadinessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 2000,
        }
    }
}

impl OperatorConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else fall back to defaults.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "resyncIntervalSecs must be greater than zero".to_string(),
            ));
        }
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "retryIntervalSecs must be greater than zero".to_string(),
            ));
        }
        if self.readiness.timeout_secs == 0 || self.readiness.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "readiness timeout and poll interval must be greater than zero".to_string(),
            ));
        }
        if self.readiness.timeout_secs > MAX_READINESS_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "readiness timeout must not exceed {} seconds",
                MAX_READINESS_TIMEOUT_SECS
            )));
        }
        if self.monitoring.thanos_querier.enabled {
            Factory::new(self.monitoring.clone())
                .thanos_querier_requires_grafana()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.monitoring.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".to_string()));
        }
        if self.monitoring.user_workload_namespace.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "userWorkloadNamespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_secs(self.readiness.timeout_secs),
            poll_interval: Duration::from_millis(self.readiness.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = OperatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.wait_policy(), WaitPolicy::default());
    }

    #[tokio::test]
    async fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mstack.json");
        std::fs::write(
            &path,
            r#"{ "retryIntervalSecs": 5, "monitoring": { "userWorkload": { "enabled": true } } }"#,
        )
        .unwrap();

        let config = OperatorConfig::load(&path).await.unwrap();
        assert_eq!(config.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.resync_interval_secs, 300);
        assert!(config.monitoring.user_workload.enabled);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mstack.json");
        std::fs::write(&path, r#"{ "resyncIntervalSecs": 0 }"#).unwrap();
        assert!(matches!(
            OperatorConfig::load(&path).await,
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_json_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mstack.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = OperatorConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("mstack.json"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = OperatorConfig::load(Path::new("/nonexistent/mstack.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_querier_without_grafana_rejected() {
        let mut config = OperatorConfig::default();
        config.monitoring.grafana.enabled = false;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: thanosQuerier requires grafana to be enabled"
        );

        config.monitoring.thanos_querier.enabled = false;
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn test_huge_readiness_timeout_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mstack.json");
        std::fs::write(
            &path,
            r#"{ "readiness": { "timeoutSecs": 18446744073709551615 } }"#,
        )
        .unwrap();
        assert!(matches!(
            OperatorConfig::load(&path).await,
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let mut config = OperatorConfig::default();
        config.monitoring.namespace = String::new();
        assert!(config.validate().is_err());
    }
}
