use crate::manifests::{Factory, MonitoringConfig};
use crate::plan::{Apply, Plan, Source, Stage};
use crate::resource::{ManagedResource, ResourceKind};
use crate::task::Component;

const LABEL: &str = "Thanos Querier";
const HTPASSWD_LABEL: &str = "Thanos Querier htpasswd";

/// Thanos Querier, fronted by an OAuth proxy whose htpasswd file admits
/// Grafana's basic-auth user.
pub struct ThanosQuerier;

impl ThanosQuerier {
    /// htpasswd secret built at execution time from Grafana's stored
    /// datasources secret. Upserted, so it follows a regenerated password.
    fn htpasswd_stage(f: &Factory) -> Stage {
        let keys = f
            .thanos_querier_htpasswd_secret_key()
            .and_then(|target| Ok((target, f.grafana_datasources_key()?)));
        match keys {
            Ok((target, source)) => {
                let factory = f.clone();
                Stage::derived(
                    target,
                    HTPASSWD_LABEL,
                    Apply::CreateOrUpdate,
                    Source {
                        key: source,
                        label: "Grafana datasources".to_string(),
                    },
                    Box::new(move |stored: &ManagedResource| {
                        factory.thanos_querier_htpasswd_secret_from(stored)
                    }),
                )
                .requires(f.thanos_querier_requires_grafana())
            }
            Err(e) => Stage::create_once(ResourceKind::Secret, HTPASSWD_LABEL, Err(e)),
        }
    }
}

impl Component for ThanosQuerier {
    const NAME: &'static str = "thanos-querier";

    fn enabled(config: &MonitoringConfig) -> bool {
        config.thanos_querier.enabled
    }

    fn plan(f: &Factory) -> Plan {
        Plan::new(Self::NAME)
            .stage(Stage::upsert(
                ResourceKind::ServiceAccount,
                LABEL,
                f.thanos_querier_service_account(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ClusterRole,
                LABEL,
                f.thanos_querier_cluster_role(),
            ))
            .stage(Stage::upsert(
                ResourceKind::ClusterRoleBinding,
                LABEL,
                f.thanos_querier_cluster_role_binding(),
            ))
            .stage(Stage::upsert(
                ResourceKind::Service,
                LABEL,
                f.thanos_querier_service(),
            ))
            .stage(
                Stage::create_once(ResourceKind::Route, LABEL, f.thanos_querier_route())
                    .await_ready(),
            )
            .stage(Stage::create_once(
                ResourceKind::Secret,
                "Thanos Querier OAuth Cookie",
                f.thanos_querier_oauth_cookie_secret(),
            ))
            .stage(Self::htpasswd_stage(f))
            .stage(Stage::create_once(
                ResourceKind::Secret,
                "Thanos Querier RBAC proxy",
                f.thanos_querier_rbac_proxy_secret(),
            ))
            .stage(
                Stage::upsert(
                    ResourceKind::Deployment,
                    LABEL,
                    f.thanos_querier_deployment(),
                )
                .await_ready(),
            )
            .stage(Stage::upsert(
                ResourceKind::ServiceMonitor,
                LABEL,
                f.thanos_querier_service_monitor(),
            ))
    }
}
