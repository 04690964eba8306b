use std::net::{IpAddr, SocketAddr};
use tracing::{info, warn};

use super::{CheckContext, CheckOutcome, CheckReport, CheckTally};
use crate::config::ServiceTarget;
use crate::probe::{DnsResolver, ProbeResult, https_url, interfaces_exceeding};

const STATUS_OK: u16 = 200;
const STATUS_UNAUTHORIZED: u16 = 401;
const HEALTH_PATH: &str = "/livez?verbose";

/// Record the outcome in the tally and package the report
fn finish(
    name: impl Into<String>,
    outcome: CheckOutcome,
    details: Vec<String>,
    tally: &mut CheckTally,
) -> CheckReport {
    let name = name.into();
    tally.record(&outcome);
    match &outcome {
        CheckOutcome::Fail(reason) => warn!(check = %name, %reason, "check failed"),
        CheckOutcome::PassWithNote(note) => info!(check = %name, %note, "check passed with note"),
        CheckOutcome::Pass => info!(check = %name, "check passed"),
    }
    CheckReport {
        name,
        outcome,
        details,
    }
}

async fn icmp_reachability(
    ctx: &CheckContext,
    name: String,
    target: IpAddr,
    tally: &mut CheckTally,
) -> CheckReport {
    let outcome;
    let mut details = Vec::new();
    match ctx.echo(target, ctx.config.payload_size, true).await {
        ProbeResult::Success(reply) => {
            details.push(format!(
                "reply from {} in {:.1}ms",
                reply.responder,
                reply.rtt.as_secs_f64() * 1000.0
            ));
            outcome = CheckOutcome::Pass;
        }
        ProbeResult::Timeout => {
            outcome = CheckOutcome::Fail(format!(
                "no reply from {} within {:.1}s",
                target,
                ctx.config.icmp_timeout.as_secs_f64()
            ));
        }
        ProbeResult::Failure(e) => outcome = CheckOutcome::Fail(e.to_string()),
    }
    finish(name, outcome, details, tally)
}

/// Ping the host gateway with DF set
pub async fn gateway_connectivity(ctx: &CheckContext, tally: &mut CheckTally) -> CheckReport {
    let name = "Gateway connectivity";
    match ctx.gateway {
        Some(gateway) => icmp_reachability(ctx, format!("{} ({})", name, gateway), gateway, tally).await,
        None => finish(
            name,
            CheckOutcome::Fail("no default gateway configured or detected".into()),
            Vec::new(),
            tally,
        ),
    }
}

/// Ping an arbitrary destination with DF set
pub async fn destination_connectivity(
    ctx: &CheckContext,
    destination: IpAddr,
    tally: &mut CheckTally,
) -> CheckReport {
    icmp_reachability(ctx, format!("Connectivity to {}", destination), destination, tally).await
}

/// Outcome for one unauthenticated API server probe.
///
/// A 401 is the expected answer to an anonymous request. Any other status
/// still proves the server answered, so it passes with a note.
fn classify_unauthenticated(status: u16) -> CheckOutcome {
    if status == STATUS_UNAUTHORIZED {
        CheckOutcome::Pass
    } else {
        CheckOutcome::PassWithNote(format!("returned a non 401 HTTP code ({})", status))
    }
}

/// HTTPS reachability of the Kubernetes API service IP, without credentials
pub async fn apiserver_service_connectivity(ctx: &CheckContext, tally: &mut CheckTally) -> CheckReport {
    let name = "Kube API service IP connectivity";
    let Some(apiserver) = ctx.config.apiserver else {
        return finish(
            name,
            CheckOutcome::Fail("no API service address configured".into()),
            Vec::new(),
            tally,
        );
    };

    let url = https_url(apiserver, "");
    let outcome = match ctx.http().probe(&url, None).await {
        Ok(response) => classify_unauthenticated(response.status),
        Err(e) => CheckOutcome::Fail(format!("{}: {}", url, e)),
    };
    finish(format!("{} ({})", name, apiserver), outcome, Vec::new(), tally)
}

/// HTTPS reachability of every API server endpoint.
///
/// Passes only if every configured endpoint answered.
pub async fn apiserver_endpoint_connectivity(ctx: &CheckContext, tally: &mut CheckTally) -> CheckReport {
    let name = "Kube API endpoint IP connectivity";
    let endpoints: &[SocketAddr] = &ctx.config.endpoints;
    if endpoints.is_empty() {
        return finish(
            name,
            CheckOutcome::Fail("no API server endpoints configured".into()),
            Vec::new(),
            tally,
        );
    }

    let mut details = Vec::with_capacity(endpoints.len());
    let mut answered = 0usize;
    for endpoint in endpoints {
        let url = https_url(*endpoint, "");
        match ctx.http().probe(&url, None).await {
            Ok(response) => {
                answered += 1;
                match classify_unauthenticated(response.status) {
                    CheckOutcome::PassWithNote(note) => details.push(format!("{}: passed, {}", url, note)),
                    _ => details.push(format!("{}: passed", url)),
                }
            }
            Err(e) => details.push(format!("{}: failed, {}", url, e)),
        }
    }

    let outcome = if answered == endpoints.len() {
        CheckOutcome::Pass
    } else {
        CheckOutcome::Fail(format!(
            "{} of {} endpoints did not answer",
            endpoints.len() - answered,
            endpoints.len()
        ))
    };
    finish(name, outcome, details, tally)
}

/// `/livez?verbose` on the API service, authenticated with the pod's
/// service account token. Only a 200 passes.
pub async fn apiserver_health(ctx: &CheckContext, tally: &mut CheckTally) -> CheckReport {
    let name = "Kube API server health";
    let Some(apiserver) = ctx.config.apiserver else {
        return finish(
            name,
            CheckOutcome::Fail("no API service address configured".into()),
            Vec::new(),
            tally,
        );
    };

    let token_path = &ctx.config.token_path;
    let token = match tokio::fs::read_to_string(token_path).await {
        Ok(token) if !token.trim().is_empty() => token,
        Ok(_) => {
            return finish(
                name,
                CheckOutcome::Fail(format!("service account token {} is empty", token_path.display())),
                Vec::new(),
                tally,
            );
        }
        Err(e) => {
            return finish(
                name,
                CheckOutcome::Fail(format!(
                    "cannot read service account token {}: {}",
                    token_path.display(),
                    e
                )),
                Vec::new(),
                tally,
            );
        }
    };

    let url = https_url(apiserver, HEALTH_PATH);
    let mut details = Vec::new();
    let outcome = match ctx.http().probe(&url, Some(&token)).await {
        Ok(response) if response.status == STATUS_OK => {
            details.extend(response.body_text().lines().map(str::to_string));
            if response.truncated {
                details.push("(output truncated)".to_string());
            }
            CheckOutcome::Pass
        }
        Ok(response) => CheckOutcome::Fail(format!(
            "health endpoint returned HTTP {} instead of 200",
            response.status
        )),
        Err(e) => CheckOutcome::Fail(format!("{}: {}", url, e)),
    };
    finish(name, outcome, details, tally)
}

/// Resolve a service through the cluster DNS server and compare with its
/// ClusterIP
pub async fn dns_lookup(ctx: &CheckContext, service: &ServiceTarget, tally: &mut CheckTally) -> CheckReport {
    let fqdn = service.fqdn(&ctx.config.cluster_domain);
    let name = format!("DNS lookup of {}", fqdn);
    let Some(server) = ctx.config.dns_server else {
        return finish(
            name,
            CheckOutcome::Fail("no DNS server configured".into()),
            Vec::new(),
            tally,
        );
    };

    let resolver = DnsResolver::new(SocketAddr::new(server, ctx.config.dns_port), ctx.config.dns_timeout);
    let mut details = Vec::new();
    let outcome = match resolver.lookup_a(&fqdn).await {
        Ok(records) => {
            details.push(format!("{} returned {:?}", resolver.server(), records.addresses));
            if records.contains(&service.expected_ip) {
                CheckOutcome::Pass
            } else {
                CheckOutcome::Fail(format!(
                    "{} resolved to {:?}, expected {}",
                    fqdn, records.addresses, service.expected_ip
                ))
            }
        }
        Err(e) => CheckOutcome::Fail(format!("lookup via {} failed: {}", resolver.server(), e)),
    };
    finish(name, outcome, details, tally)
}

/// Discover the path MTU to `destination` and flag local interfaces whose
/// MTU is larger. Passes whenever discovery succeeds.
pub async fn path_mtu(ctx: &CheckContext, destination: IpAddr, tally: &mut CheckTally) -> CheckReport {
    let name = format!("Path MTU to {}", destination);
    let pmtu = match ctx.discover_pmtu(destination).await {
        Ok(pmtu) => pmtu,
        Err(e) => return finish(name, CheckOutcome::Fail(e.to_string()), Vec::new(), tally),
    };

    let mut details = vec![format!(
        "path MTU {} (largest ICMP payload {}, {} probes)",
        pmtu.mtu, pmtu.payload_size, pmtu.probes
    )];
    for iface in interfaces_exceeding(&ctx.local_interfaces(), pmtu.mtu) {
        if let Some(mtu) = iface.mtu {
            details.push(format!(
                "interface {} has MTU {}, larger than the path MTU {}",
                iface.name, mtu, pmtu.mtu
            ));
        }
    }
    finish(name, CheckOutcome::Pass, details, tally)
}
