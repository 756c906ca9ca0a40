//! The monitoring stack components.

mod grafana;
mod prometheus_user_workload;
mod thanos_querier;

pub use grafana::Grafana;
pub use prometheus_user_workload::PrometheusUserWorkload;
pub use thanos_querier::ThanosQuerier;

use crate::task::ComponentTask;

pub type GrafanaTask = ComponentTask<Grafana>;
pub type ThanosQuerierTask = ComponentTask<ThanosQuerier>;
pub type PrometheusUserWorkloadTask = ComponentTask<PrometheusUserWorkload>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifests::{Factory, MonitoringConfig, UserWorkloadConfig};
    use crate::plan::{Direction, Verb};
    use crate::resource::ResourceKind;
    use crate::task::Component;

    fn factory() -> Factory {
        Factory::new(MonitoringConfig {
            user_workload: UserWorkloadConfig {
                enabled: true,
                namespaces: vec!["team-a".to_string()],
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_component_plans_are_ordered() {
        let f = factory();
        Grafana::plan(&f).check_order().unwrap();
        ThanosQuerier::plan(&f).check_order().unwrap();
        PrometheusUserWorkload::plan(&f).check_order().unwrap();
    }

    #[test]
    fn test_workload_wait_precedes_service_monitor() {
        let seq = ThanosQuerier::plan(&factory()).sequence(Direction::Converging);
        let wait = seq
            .iter()
            .position(|s| s.verb == Verb::WaitUntilReady && s.subject.kind == ResourceKind::Deployment)
            .unwrap();
        let monitor = seq
            .iter()
            .position(|s| s.subject.kind == ResourceKind::ServiceMonitor)
            .unwrap();
        assert_eq!(monitor, wait + 1);
        assert_eq!(monitor, seq.len() - 1);
    }

    #[test]
    fn test_user_workload_lists_expand() {
        let seq = PrometheusUserWorkload::plan(&factory()).sequence(Direction::Converging);
        let bindings = seq
            .iter()
            .filter(|s| s.subject.kind == ResourceKind::RoleBinding)
            .count();
        // one per watched namespace plus the config binding
        assert_eq!(bindings, 3);
    }
}
