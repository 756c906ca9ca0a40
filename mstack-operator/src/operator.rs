//! Reconciliation driver.
//!
//! Runs the component tasks in groups: groups one after the other, the tasks
//! of a group concurrently. A pass stops at the first group with a failed
//! task, since later groups may read what that group produces.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use mstack_tasks::components::{GrafanaTask, PrometheusUserWorkloadTask, ThanosQuerierTask};
use mstack_tasks::{
    Executor, ReconcileError, ResourceClient, SharedConfig, Shutdown, StepSequence, Task,
};

use crate::config::OperatorConfig;

/// Tasks that may run concurrently.
pub struct TaskGroup {
    pub name: &'static str,
    pub tasks: Vec<Arc<dyn Task>>,
}

/// A pass that stopped at a failed group.
///
/// The error of the first failed task is the source.
#[derive(Debug)]
pub struct PassError {
    pub group: &'static str,
    pub total: usize,
    pub failures: Vec<(&'static str, ReconcileError)>,
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks: Vec<_> = self.failures.iter().map(|(task, _)| *task).collect();
        write!(
            f,
            "task group {} failed ({} of {} task(s): {})",
            self.group,
            self.failures.len(),
            self.total,
            tasks.join(", ")
        )
    }
}

impl std::error::Error for PassError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|(_, e)| e as &(dyn std::error::Error + 'static))
    }
}

pub struct Operator {
    settings: RwLock<OperatorConfig>,
    monitoring: SharedConfig,
    groups: Vec<TaskGroup>,
    config_path: Option<PathBuf>,
}

impl Operator {
    /// Operator running the default task groups against `client`.
    pub fn new(
        settings: OperatorConfig,
        client: Arc<dyn ResourceClient>,
        shutdown: Shutdown,
    ) -> Self {
        let monitoring: SharedConfig = Arc::new(RwLock::new(settings.monitoring.clone()));
        let executor = Executor::new(client)
            .with_wait_policy(settings.wait_policy())
            .with_shutdown(shutdown);

        let grafana: Arc<dyn Task> = Arc::new(GrafanaTask::new(monitoring.clone(), executor.clone()));
        let thanos: Arc<dyn Task> =
            Arc::new(ThanosQuerierTask::new(monitoring.clone(), executor.clone()));
        let user_workload: Arc<dyn Task> =
            Arc::new(PrometheusUserWorkloadTask::new(monitoring.clone(), executor));

        // The querier reads the datasources secret Grafana creates.
        let groups = vec![
            TaskGroup {
                name: "grafana",
                tasks: vec![grafana],
            },
            TaskGroup {
                name: "querier",
                tasks: vec![thanos, user_workload],
            },
        ];

        Self {
            settings: RwLock::new(settings),
            monitoring,
            groups,
            config_path: None,
        }
    }

    /// Re-read `path` before every pass.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub async fn settings(&self) -> OperatorConfig {
        self.settings.read().await.clone()
    }

    /// Replace the configuration seen by subsequent passes.
    ///
    /// Readiness settings are fixed at construction.
    pub async fn apply_settings(&self, settings: OperatorConfig) {
        *self.monitoring.write().await = settings.monitoring.clone();
        *self.settings.write().await = settings;
    }

    async fn reload(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        match OperatorConfig::load(path).await {
            Ok(settings) => {
                if settings != self.settings().await {
                    info!(path = %path.display(), "Configuration changed");
                    self.apply_settings(settings).await;
                }
            }
            Err(e) => warn!(error = %e, "Keeping previous configuration"),
        }
    }

    /// Run every group once.
    pub async fn reconcile_once(&self) -> Result<(), PassError> {
        for group in &self.groups {
            let results = join_all(group.tasks.iter().map(|t| t.run())).await;

            let failures: Vec<_> = group
                .tasks
                .iter()
                .zip(results)
                .filter_map(|(task, result)| result.err().map(|e| (task.name(), e)))
                .collect();

            for (task, e) in &failures {
                error!(task = *task, kind = ?e.kind(), "{}", e.detailed());
            }
            if !failures.is_empty() {
                return Err(PassError {
                    group: group.name,
                    total: group.tasks.len(),
                    failures,
                });
            }
        }
        Ok(())
    }

    /// The step sequence each task would run next, in execution order.
    pub async fn preview(&self) -> Vec<(&'static str, Result<StepSequence, ReconcileError>)> {
        let mut out = Vec::new();
        for group in &self.groups {
            for task in &group.tasks {
                out.push((task.name(), task.preview().await));
            }
        }
        out
    }

    /// Run passes until shutdown.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut pass: u64 = 0;
        while !shutdown.is_triggered() {
            pass += 1;
            self.reload().await;

            let settings = self.settings().await;
            let pause: Duration = match self.reconcile_once().await {
                Ok(()) => {
                    info!(pass, "Reconciliation pass complete");
                    settings.resync_interval()
                }
                Err(e) => {
                    warn!(pass, retry_secs = settings.retry_interval_secs, "{}", e);
                    settings.retry_interval()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.triggered() => {}
            }
        }
        info!("Reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mstack_tasks::memory::CallKind;
    use mstack_tasks::{ClientError, ErrorKind, MemoryClient, ResourceKey, ResourceKind};

    fn operator(client: Arc<MemoryClient>) -> Operator {
        Operator::new(OperatorConfig::default(), client, Shutdown::never())
    }

    #[tokio::test]
    async fn test_pass_converges_enabled_components() {
        let client = Arc::new(MemoryClient::new());
        operator(client.clone()).reconcile_once().await.unwrap();

        let deployments: Vec<_> = client
            .keys()
            .await
            .into_iter()
            .filter(|k| k.kind == ResourceKind::Deployment)
            .map(|k| k.name)
            .collect();
        assert_eq!(deployments, vec!["grafana", "thanos-querier"]);
        assert!(
            !client
                .keys()
                .await
                .iter()
                .any(|k| k.kind == ResourceKind::Prometheus)
        );
    }

    #[tokio::test]
    async fn test_failed_group_stops_pass() {
        let client = Arc::new(MemoryClient::new());
        let sa = ResourceKey::namespaced(ResourceKind::ServiceAccount, "monitoring", "grafana");
        client
            .fail_on(
                CallKind::CreateOrUpdate,
                sa,
                ClientError::Forbidden("denied".into()),
            )
            .await;

        let err = operator(client.clone()).reconcile_once().await.unwrap_err();
        assert_eq!(err.group, "grafana");
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].1.kind(), ErrorKind::Operation);
        assert_eq!(
            err.to_string(),
            "task group grafana failed (1 of 1 task(s): grafana)"
        );
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("reconciling Grafana ServiceAccount \"grafana\" failed"));
        assert!(chain.contains("forbidden: denied"));
        assert!(
            !client
                .journal()
                .await
                .iter()
                .any(|c| c.key.name == "thanos-querier")
        );
    }

    #[tokio::test]
    async fn test_apply_settings_tears_down_disabled() {
        let client = Arc::new(MemoryClient::new());
        let op = operator(client.clone());
        op.reconcile_once().await.unwrap();

        let mut settings = op.settings().await;
        settings.monitoring.thanos_querier.enabled = false;
        op.apply_settings(settings).await;
        op.reconcile_once().await.unwrap();

        assert!(
            !client
                .keys()
                .await
                .iter()
                .any(|k| k.name.starts_with("thanos-querier"))
        );
        assert!(
            client
                .contains(&ResourceKey::namespaced(
                    ResourceKind::Deployment,
                    "monitoring",
                    "grafana"
                ))
                .await
        );
    }

    #[tokio::test]
    async fn test_preview_does_not_touch_store() {
        let client = Arc::new(MemoryClient::new());
        let preview = operator(client.clone()).preview().await;
        let names: Vec<_> = preview.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["grafana", "thanos-querier", "prometheus-user-workload"]
        );
        assert!(client.journal().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let client = Arc::new(MemoryClient::new());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let op = Arc::new(Operator::new(
            OperatorConfig::default(),
            client.clone(),
            Shutdown::new(rx.clone()),
        ));

        let handle = tokio::spawn({
            let op = op.clone();
            async move { op.run(Shutdown::new(rx)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!client.keys().await.is_empty());
    }
}
