use crate::manifests::{Factory, MonitoringConfig};
use crate::plan::{Plan, Stage};
use crate::resource::ResourceKind;
use crate::task::Component;

const LABEL: &str = "Grafana";

/// Grafana and the datasources secret other components read.
pub struct Grafana;

impl Component for Grafana {
    const NAME: &'static str = "grafana";

    fn enabled(config: &MonitoringConfig) -> bool {
        config.grafana.enabled
    }

    fn plan(f: &Factory) -> Plan {
        Plan::new(Self::NAME)
            .stage(Stage::create_once(
                ResourceKind::Secret,
                "Grafana datasources",
                f.grafana_datasources(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ServiceAccount,
                LABEL,
                f.grafana_service_account(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ClusterRole,
                LABEL,
                f.grafana_cluster_role(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ClusterRoleBinding,
                LABEL,
                f.grafana_cluster_role_binding(),
            ))
            .stage(Stage::upsert(ResourceKind::Service, LABEL, f.grafana_service()))
            .stage(Stage::create_once(ResourceKind::Route, LABEL, f.grafana_route()).await_ready())
            .stage(
                Stage::upsert(ResourceKind::Deployment, LABEL, f.grafana_deployment())
                    .await_ready(),
            )
            .stage(Stage::upsert(
                ResourceKind::ServiceMonitor,
                LABEL,
                f.grafana_service_monitor(),
            ))
    }
}
