//! Reconciliation tasks.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ReconcileError;
use crate::executor::Executor;
use crate::manifests::{Factory, MonitoringConfig};
use crate::plan::{Direction, Plan, StepSequence};

/// Configuration shared between the driver, which may replace it between
/// passes, and the tasks reading it.
pub type SharedConfig = Arc<RwLock<MonitoringConfig>>;

/// A unit of reconciliation run by the driver.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive the component's objects toward its enablement flag: present and
    /// ready when enabled, absent otherwise.
    async fn run(&self) -> Result<(), ReconcileError>;

    /// The step sequence the next [`run`](Self::run) would execute.
    async fn preview(&self) -> Result<StepSequence, ReconcileError>;
}

/// A monitoring component: an enablement flag and the plan of objects it owns.
pub trait Component: Send + Sync + 'static {
    const NAME: &'static str;

    fn enabled(config: &MonitoringConfig) -> bool;

    fn plan(factory: &Factory) -> Plan;
}

/// Runs one [`Component`] against the executor's resource client.
pub struct ComponentTask<C> {
    config: SharedConfig,
    executor: Executor,
    _component: PhantomData<fn() -> C>,
}

impl<C: Component> ComponentTask<C> {
    pub fn new(config: SharedConfig, executor: Executor) -> Self {
        Self {
            config,
            executor,
            _component: PhantomData,
        }
    }

    /// Plan and direction for the current configuration snapshot.
    pub async fn plan(&self) -> (Plan, Direction) {
        let config = self.config.read().await.clone();
        let direction = Direction::from_enabled(C::enabled(&config));
        (C::plan(&Factory::new(config)), direction)
    }
}

#[async_trait]
impl<C: Component> Task for ComponentTask<C> {
    fn name(&self) -> &'static str {
        C::NAME
    }

    async fn run(&self) -> Result<(), ReconcileError> {
        let (plan, direction) = self.plan().await;
        debug!(component = C::NAME, %direction, "Running task");
        plan.check_order()?;
        self.executor.execute(&plan, direction).await?;
        info!(component = C::NAME, %direction, "Task finished");
        Ok(())
    }

    async fn preview(&self) -> Result<StepSequence, ReconcileError> {
        let (plan, direction) = self.plan().await;
        plan.check_order()?;
        Ok(plan.sequence(direction))
    }
}
