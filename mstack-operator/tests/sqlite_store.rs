use std::sync::Arc;
use std::time::Duration;

use mstack_operator::{Operator, OperatorConfig, ReadinessConfig, SqliteClient};
use mstack_tasks::{ErrorKind, ResourceClient, ResourceKey, ResourceKind, Shutdown};
use tempfile::TempDir;
use tokio::sync::watch;

async fn setup(auto_ready: bool) -> (Arc<SqliteClient>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = SqliteClient::new(dir.path().to_str().unwrap(), auto_ready)
        .await
        .unwrap();
    (Arc::new(store), dir)
}

fn settings(timeout_secs: u64) -> OperatorConfig {
    OperatorConfig {
        readiness: ReadinessConfig {
            timeout_secs,
            poll_interval_ms: 20,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_pass_against_sqlite() {
    let (store, _dir) = setup(true).await;
    let operator = Operator::new(settings(5), store.clone(), Shutdown::never());

    operator.reconcile_once().await.unwrap();
    let keys = store.list_keys().await.unwrap();
    assert!(keys.contains(&ResourceKey::namespaced(
        ResourceKind::Secret,
        "monitoring",
        "thanos-querier-oauth-htpasswd"
    )));

    // second pass changes nothing
    let before = store
        .entry(&ResourceKey::namespaced(
            ResourceKind::Deployment,
            "monitoring",
            "thanos-querier",
        ))
        .await
        .unwrap()
        .unwrap();
    operator.reconcile_once().await.unwrap();
    let after = store.entry(&before.resource.key).await.unwrap().unwrap();
    assert_eq!(before.generation, after.generation);
    assert_eq!(store.list_keys().await.unwrap().len(), keys.len());
}

#[tokio::test]
async fn test_unobserved_route_times_out() {
    let (store, _dir) = setup(false).await;
    let operator = Operator::new(settings(1), store.clone(), Shutdown::never());

    let err = operator.reconcile_once().await.unwrap_err();
    assert_eq!(err.group, "grafana");
    assert_eq!(err.failures[0].1.kind(), ErrorKind::ReadinessTimeout);
    assert_eq!(err.failures[0].1.subject.kind, ResourceKind::Route);
}

#[tokio::test]
async fn test_external_agent_observes_writes() {
    let (store, _dir) = setup(false).await;
    let operator = Operator::new(settings(10), store.clone(), Shutdown::never());

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let agent = tokio::spawn({
        let store = store.clone();
        async move {
            loop {
                for key in store.list_keys().await.unwrap() {
                    store.mark_observed(&key).await.unwrap();
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    _ = stop_rx.changed() => return,
                }
            }
        }
    });

    operator.reconcile_once().await.unwrap();
    stop_tx.send(true).unwrap();
    agent.await.unwrap();

    assert!(
        store
            .is_ready(&ResourceKey::namespaced(
                ResourceKind::Deployment,
                "monitoring",
                "thanos-querier",
            ))
            .await
            .unwrap()
    );
}
