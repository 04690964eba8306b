use std::net::IpAddr;
use tracing::{info, warn};

use super::{
    CheckContext, CheckReport, CheckTally, apiserver_endpoint_connectivity, apiserver_health,
    apiserver_service_connectivity, destination_connectivity, dns_lookup, gateway_connectivity,
    path_mtu,
};
use crate::config::{Config, ServiceTarget};

/// One check scheduled for this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedCheck {
    Gateway,
    Destination(IpAddr),
    ApiServerService,
    ApiServerEndpoints,
    ApiServerHealth,
    Dns(ServiceTarget),
    PathMtu(IpAddr),
}

impl PlannedCheck {
    pub async fn run(&self, ctx: &CheckContext, tally: &mut CheckTally) -> CheckReport {
        match self {
            PlannedCheck::Gateway => gateway_connectivity(ctx, tally).await,
            PlannedCheck::Destination(dst) => destination_connectivity(ctx, *dst, tally).await,
            PlannedCheck::ApiServerService => apiserver_service_connectivity(ctx, tally).await,
            PlannedCheck::ApiServerEndpoints => apiserver_endpoint_connectivity(ctx, tally).await,
            PlannedCheck::ApiServerHealth => apiserver_health(ctx, tally).await,
            PlannedCheck::Dns(service) => dns_lookup(ctx, service, tally).await,
            PlannedCheck::PathMtu(dst) => path_mtu(ctx, *dst, tally).await,
        }
    }
}

/// Checks whose inputs are present, in run order.
///
/// Checks with missing inputs are left out with a warning rather than
/// reported as failures.
pub fn build_plan(config: &Config, gateway: Option<IpAddr>) -> Vec<PlannedCheck> {
    let mut plan = Vec::new();

    match gateway {
        Some(_) => plan.push(PlannedCheck::Gateway),
        None => warn!("Skipping gateway check: no gateway configured or detected"),
    }

    plan.extend(config.destinations.iter().copied().map(PlannedCheck::Destination));

    if config.apiserver.is_some() {
        plan.push(PlannedCheck::ApiServerService);
    } else {
        warn!("Skipping API server checks: set --apiserver-ip or KUBERNETES_SERVICE_HOST");
    }

    if !config.endpoints.is_empty() {
        plan.push(PlannedCheck::ApiServerEndpoints);
    }

    if config.apiserver.is_some() {
        plan.push(PlannedCheck::ApiServerHealth);
    }

    match (&config.dns_server, &config.dns_target) {
        (Some(_), Some(service)) => plan.push(PlannedCheck::Dns(service.clone())),
        (None, Some(_)) => warn!("Skipping DNS check: no --dns-server given"),
        (Some(_), None) => warn!("Skipping DNS check: --svc-name, --svc-namespace and --svc-ip are required"),
        (None, None) => {}
    }

    if config.pmtu_enabled {
        plan.extend(config.destinations.iter().copied().map(PlannedCheck::PathMtu));
    }

    plan
}

/// Run the plan in order, handing each report to `on_report` as it
/// completes. Stops early if the run is cancelled between checks.
pub async fn run_plan<F>(
    ctx: &CheckContext,
    plan: &[PlannedCheck],
    tally: &mut CheckTally,
    mut on_report: F,
) -> Vec<CheckReport>
where
    F: FnMut(&CheckReport),
{
    let mut reports = Vec::with_capacity(plan.len());
    for check in plan {
        if ctx.cancel_token().is_cancelled() {
            info!(remaining = plan.len() - reports.len(), "run cancelled");
            break;
        }
        let report = check.run(ctx, tally).await;
        on_report(&report);
        reports.push(report);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn service() -> ServiceTarget {
        ServiceTarget {
            name: "api".into(),
            namespace: "default".into(),
            expected_ip: Ipv4Addr::new(10, 0, 0, 1),
        }
    }

    #[test]
    fn test_empty_config_plans_nothing() {
        assert!(build_plan(&Config::default(), None).is_empty());
    }

    #[test]
    fn test_full_plan_order() {
        let dst: IpAddr = "10.1.0.5".parse().unwrap();
        let config = Config {
            destinations: vec![dst],
            apiserver: Some("10.96.0.1:443".parse().unwrap()),
            endpoints: vec!["172.18.0.2:6443".parse().unwrap()],
            dns_server: Some("10.96.0.10".parse().unwrap()),
            dns_target: Some(service()),
            ..Config::default()
        };
        let plan = build_plan(&config, Some("10.1.0.1".parse().unwrap()));
        assert_eq!(
            plan,
            vec![
                PlannedCheck::Gateway,
                PlannedCheck::Destination(dst),
                PlannedCheck::ApiServerService,
                PlannedCheck::ApiServerEndpoints,
                PlannedCheck::ApiServerHealth,
                PlannedCheck::Dns(service()),
                PlannedCheck::PathMtu(dst),
            ]
        );
    }

    #[test]
    fn test_dns_needs_server_and_target() {
        let config = Config {
            dns_target: Some(service()),
            ..Config::default()
        };
        assert!(build_plan(&config, None).is_empty());
    }

    #[test]
    fn test_pmtu_can_be_disabled() {
        let config = Config {
            destinations: vec!["10.1.0.5".parse().unwrap()],
            pmtu_enabled: false,
            ..Config::default()
        };
        let plan = build_plan(&config, None);
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan[0], PlannedCheck::Destination(_)));
    }
}
