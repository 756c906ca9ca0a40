//! Runs a plan's step sequence against a resource client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::client::{ResourceClient, WaitBudget};
use crate::error::{Cause, Operation, ReconcileError, Subject};
use crate::plan::{
    DeriveError, Direction, Plan, Scheduled, Target, Verb, check_written_before, written_at,
};
use crate::resource::{ManagedResource, ResourceKey};
use crate::shutdown::Shutdown;

/// Bounds applied to every readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Executes step sequences in order, stopping at the first failure.
#[derive(Clone)]
pub struct Executor {
    client: Arc<dyn ResourceClient>,
    wait: WaitPolicy,
    shutdown: Shutdown,
}

impl Executor {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            wait: WaitPolicy::default(),
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run every step of `plan` in `direction`.
    ///
    /// On error, the steps before the failing one have been applied and
    /// nothing after it was attempted.
    pub async fn execute(&self, plan: &Plan, direction: Direction) -> Result<(), ReconcileError> {
        let steps = plan.schedule(direction);
        debug!(
            component = plan.component(),
            %direction,
            steps = steps.len(),
            "Executing plan"
        );

        let written = written_at(&steps);
        for (at, step) in steps.iter().enumerate() {
            self.run_step(step, at, &written).await?;
        }

        info!(component = plan.component(), %direction, "Plan complete");
        Ok(())
    }

    async fn run_step(
        &self,
        step: &Scheduled<'_>,
        at: usize,
        written: &HashMap<&ResourceKey, usize>,
    ) -> Result<(), ReconcileError> {
        let fail = |operation: Operation, cause: Cause| {
            ReconcileError::new(operation, step.subject(), cause)
        };

        match step.verb {
            Verb::CreateIfAbsent | Verb::CreateOrUpdate => {
                if let Err(e) = &step.stage.precondition {
                    return Err(fail(Operation::Initializing, e.clone().into()));
                }
                let resource = self.resolve(step).await?;
                if matches!(step.target, Target::Derived { .. }) {
                    check_written_before(step.stage, &resource, at, written)?;
                }
                debug!(resource = %resource.key, verb = %step.verb, "Applying resource");
                if step.verb == Verb::CreateIfAbsent {
                    let created = self
                        .client
                        .create_if_absent(&resource)
                        .await
                        .map_err(|e| fail(Operation::Creating, e.into()))?;
                    if created {
                        info!(resource = %resource.key, "Created resource");
                    }
                } else {
                    self.client
                        .create_or_update(&resource)
                        .await
                        .map_err(|e| fail(Operation::Reconciling, e.into()))?;
                }
            }
            Verb::WaitUntilReady => {
                let key = step
                    .key()
                    .map_err(|e| fail(Operation::Initializing, e.clone().into()))?;
                info!(
                    resource = %key,
                    timeout_secs = self.wait.timeout.as_secs(),
                    "Waiting for resource to become ready"
                );
                let budget = WaitBudget::starting_now(self.wait.timeout, self.wait.poll_interval);
                self.client
                    .wait_until_ready(key, budget, self.shutdown.clone())
                    .await
                    .map_err(|e| fail(Operation::WaitingFor, e.into()))?;
            }
            Verb::Delete => {
                let key = step
                    .key()
                    .map_err(|e| fail(Operation::Initializing, e.clone().into()))?;
                debug!(resource = %key, "Deleting resource");
                self.client
                    .delete(key)
                    .await
                    .map_err(|e| fail(Operation::Deleting, e.into()))?;
            }
        }
        Ok(())
    }

    /// The object a write step applies, deriving it from its source object
    /// if needed.
    async fn resolve(&self, step: &Scheduled<'_>) -> Result<ManagedResource, ReconcileError> {
        match step.target {
            Target::Built(resource) => Ok(resource.clone()),
            Target::Unbuilt(e) => Err(ReconcileError::new(
                Operation::Initializing,
                step.subject(),
                e.clone(),
            )),
            Target::Derived {
                source,
                key: _,
                derive,
            } => {
                let stored = self.client.get(&source.key).await.map_err(|e| {
                    let subject = Subject::new(
                        source.key.kind,
                        source.label.clone(),
                        Some(source.key.name.clone()),
                    );
                    ReconcileError::new(Operation::Retrieving, subject, e)
                })?;
                let Some(stored) = stored else {
                    return Err(ReconcileError::new(
                        Operation::Initializing,
                        step.subject(),
                        Cause::DependencyMissing {
                            dependency: source.key.clone(),
                        },
                    ));
                };
                derive(&stored).map_err(|e| {
                    let cause = match e {
                        DeriveError::Malformed(reason) => Cause::DependencyMalformed {
                            dependency: source.key.clone(),
                            reason,
                        },
                        DeriveError::Construction(e) => Cause::Construction(e),
                    };
                    ReconcileError::new(Operation::Initializing, step.subject(), cause)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::error::ErrorKind;
    use crate::manifests::ManifestError;
    use crate::memory::{CallKind, MemoryClient};
    use crate::plan::{Apply, Source, Stage};
    use crate::resource::{ResourceKey, ResourceKind};

    fn res(kind: ResourceKind, name: &str) -> ManagedResource {
        ManagedResource::new(ResourceKey::namespaced(kind, "ns", name))
    }

    fn plan() -> Plan {
        Plan::new("test")
            .stage(Stage::upsert(
                ResourceKind::ServiceAccount,
                "Test",
                Ok(res(ResourceKind::ServiceAccount, "sa")),
            ))
            .stage(Stage::create_once(
                ResourceKind::Secret,
                "Test",
                Ok(res(ResourceKind::Secret, "creds")),
            ))
            .stage(Stage::upsert(
                ResourceKind::Service,
                "Test",
                Ok(res(ResourceKind::Service, "svc")),
            ))
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_failing_step() {
        let client = Arc::new(MemoryClient::new());
        let creds = ResourceKey::namespaced(ResourceKind::Secret, "ns", "creds");
        client
            .fail_on(
                CallKind::CreateIfAbsent,
                creds.clone(),
                ClientError::Forbidden("no".into()),
            )
            .await;

        let err = Executor::new(client.clone())
            .execute(&plan(), Direction::Converging)
            .await
            .unwrap_err();

        assert_eq!(err.operation, Operation::Creating);
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert_eq!(err.subject.name.as_deref(), Some("creds"));
        assert!(
            client
                .contains(&ResourceKey::namespaced(ResourceKind::ServiceAccount, "ns", "sa"))
                .await
        );
        assert!(
            !client
                .contains(&ResourceKey::namespaced(ResourceKind::Service, "ns", "svc"))
                .await
        );
    }

    #[tokio::test]
    async fn test_unbuilt_object_fails_in_its_slot() {
        let client = Arc::new(MemoryClient::new());
        let plan = Plan::new("test")
            .stage(Stage::upsert(
                ResourceKind::ServiceAccount,
                "Test",
                Ok(res(ResourceKind::ServiceAccount, "sa")),
            ))
            .stage(Stage::upsert(
                ResourceKind::Deployment,
                "Test",
                Err(ManifestError::MissingSetting("images.app")),
            ));

        let err = Executor::new(client.clone())
            .execute(&plan, Direction::Converging)
            .await
            .unwrap_err();
        assert_eq!(err.operation, Operation::Initializing);
        assert_eq!(err.kind(), ErrorKind::Construction);
        assert_eq!(client.keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_derived_stage_reads_source() {
        let client = Arc::new(MemoryClient::new());
        let source = res(ResourceKind::Secret, "upstream")
            .with_body(serde_json::json!({ "stringData": { "token": "abc" } }));
        client.insert(source.clone()).await;

        let target = ResourceKey::namespaced(ResourceKind::Secret, "ns", "copy");
        let target_for_derive = target.clone();
        let plan = Plan::new("test").stage(Stage::derived(
            target.clone(),
            "Test copy",
            Apply::CreateOrUpdate,
            Source {
                key: source.key.clone(),
                label: "Upstream".to_string(),
            },
            Box::new(move |stored: &ManagedResource| {
                let token = stored
                    .data_field("token")
                    .ok_or_else(|| DeriveError::Malformed("no token".into()))?;
                Ok(ManagedResource::new(target_for_derive.clone())
                    .with_body(serde_json::json!({ "stringData": { "token": token } })))
            }),
        ));

        Executor::new(client.clone())
            .execute(&plan, Direction::Converging)
            .await
            .unwrap();
        let copy = client.snapshot(&target).await.unwrap();
        assert_eq!(copy.data_field("token"), Some("abc"));
    }

    #[tokio::test]
    async fn test_derived_object_written_before_its_reference_fails() {
        let client = Arc::new(MemoryClient::new());
        let source = res(ResourceKind::Secret, "upstream");
        client.insert(source.clone()).await;

        let later = res(ResourceKind::ServiceAccount, "later");
        let later_key = later.key.clone();
        let target = ResourceKey::namespaced(ResourceKind::Secret, "ns", "copy");
        let target_for_derive = target.clone();
        let plan = Plan::new("test")
            .stage(Stage::derived(
                target.clone(),
                "Test copy",
                Apply::CreateOrUpdate,
                Source {
                    key: source.key.clone(),
                    label: "Upstream".to_string(),
                },
                Box::new(move |_: &ManagedResource| {
                    Ok::<_, DeriveError>(
                        ManagedResource::new(target_for_derive.clone())
                            .depends_on(later_key.clone()),
                    )
                }),
            ))
            .stage(Stage::upsert(ResourceKind::ServiceAccount, "Test", Ok(later.clone())));

        // not visible before execution
        plan.check_order().unwrap();

        let err = Executor::new(client.clone())
            .execute(&plan, Direction::Converging)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Construction);
        assert_eq!(err.subject.name.as_deref(), Some("copy"));
        assert!(!client.contains(&target).await);
        assert!(!client.contains(&later.key).await);
    }

    #[tokio::test]
    async fn test_failed_precondition_blocks_writes_but_not_deletes() {
        let client = Arc::new(MemoryClient::new());
        let creds = res(ResourceKind::Secret, "creds");
        client.insert(creds.clone()).await;

        let plan = Plan::new("test").stage(
            Stage::create_once(ResourceKind::Secret, "Test", Ok(creds.clone())).requires(Err(
                ManifestError::RequiresComponent {
                    component: "test",
                    dependency: "upstream",
                },
            )),
        );

        let executor = Executor::new(client.clone());
        let err = executor
            .execute(&plan, Direction::Converging)
            .await
            .unwrap_err();
        assert_eq!(err.operation, Operation::Initializing);
        assert_eq!(err.kind(), ErrorKind::Construction);
        assert!(client.writes().await.is_empty());

        executor.execute(&plan, Direction::TearingDown).await.unwrap();
        assert!(!client.contains(&creds.key).await);
    }

    #[tokio::test]
    async fn test_delete_unbuilt_object_fails() {
        let client = Arc::new(MemoryClient::new());
        let plan = Plan::new("test").stage(Stage::upsert(
            ResourceKind::Deployment,
            "Test",
            Err(ManifestError::MissingSetting("images.app")),
        ));
        let err = Executor::new(client)
            .execute(&plan, Direction::TearingDown)
            .await
            .unwrap_err();
        assert_eq!(err.operation, Operation::Initializing);
    }
}
