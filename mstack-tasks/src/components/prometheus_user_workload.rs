use crate::manifests::{Factory, MonitoringConfig};
use crate::plan::{Plan, Stage};
use crate::resource::ResourceKind;
use crate::task::Component;

const LABEL: &str = "UserWorkload Prometheus";

/// Prometheus instance scraping user workload namespaces.
pub struct PrometheusUserWorkload;

impl Component for PrometheusUserWorkload {
    const NAME: &'static str = "prometheus-user-workload";

    fn enabled(config: &MonitoringConfig) -> bool {
        config.user_workload.enabled
    }

    fn plan(f: &Factory) -> Plan {
        Plan::new(Self::NAME)
            .stage(Stage::create_once(
                ResourceKind::ConfigMap,
                "UserWorkload serving certs CA Bundle",
                f.prometheus_user_workload_serving_certs_ca_bundle(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ServiceAccount,
                LABEL,
                f.prometheus_user_workload_service_account(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ClusterRole,
                LABEL,
                f.prometheus_user_workload_cluster_role(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ClusterRoleBinding,
                LABEL,
                f.prometheus_user_workload_cluster_role_binding(),
            ))
            .stage(Stage::upsert(
                ResourceKind::Role,
                "UserWorkload Prometheus config",
                f.prometheus_user_workload_role_config(),
            ))
            .stage(Stage::upsert_each(
                ResourceKind::Role,
                LABEL,
                f.prometheus_user_workload_role_list(),
            ))
            .stage(Stage::upsert_each(
                ResourceKind::RoleBinding,
                LABEL,
                f.prometheus_user_workload_role_binding_list(),
            ))
            .stage(Stage::upsert(
                ResourceKind::RoleBinding,
                "UserWorkload Prometheus config",
                f.prometheus_user_workload_role_binding_config(),
            ))
            .stage(Stage::upsert(
                ResourceKind::Service,
                LABEL,
                f.prometheus_user_workload_service(),
            ))
            .stage(
                Stage::upsert(
                    ResourceKind::Prometheus,
                    LABEL,
                    f.prometheus_user_workload(),
                )
                .await_ready(),
            )
            .stage(Stage::upsert(
                ResourceKind::ServiceMonitor,
                LABEL,
                f.prometheus_user_workload_service_monitor(),
            ))
    }
}
