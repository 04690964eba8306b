//! Integration tests for the ICMP prober and path MTU discovery
//!
//! These run the real prober (packet building, reply parsing, correlation)
//! against a simulated path, without requiring raw sockets.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{SimulatedPath, echo_reply};
use k8snetlook::check::{CheckContext, CheckOutcome, CheckTally, path_mtu};
use k8snetlook::config::Config;
use k8snetlook::error::ProbeError;
use k8snetlook::probe::{
    EchoProber, IcmpProber, PmtuConfig, ProbeResult, build_echo_request, discover_pmtu,
};
use tokio_util::sync::CancellationToken;

const TARGET: Ipv4Addr = Ipv4Addr::new(10, 96, 0, 1);
const IDENTIFIER: u16 = 0x4b38;

fn target() -> IpAddr {
    IpAddr::V4(TARGET)
}

fn prober(path: SimulatedPath, timeout: Duration) -> IcmpProber<SimulatedPath> {
    IcmpProber::with_channel(path, timeout).with_identifier(IDENTIFIER)
}

/// Most packets a discovery run may send: `ceil(log2(upper - lower))`
fn search_bound(config: &PmtuConfig) -> usize {
    let range = config.upper - config.lower;
    (usize::BITS - (range - 1).leading_zeros()) as usize
}

#[test]
fn test_echo_reply_round_trip() {
    let prober = prober(SimulatedPath::new(TARGET, Some(1472)), Duration::from_secs(1));
    match prober.probe(target(), 64, true) {
        ProbeResult::Success(reply) => {
            assert_eq!(reply.responder, target());
            assert_eq!(reply.payload_size, 64);
        }
        other => panic!("expected echo reply, got {:?}", other),
    }
}

#[test]
fn test_frag_needed_is_distinct_failure() {
    let mut path = SimulatedPath::new(TARGET, Some(1400));
    path.report_mtu = true;
    let prober = prober(path, Duration::from_secs(1));

    let result = prober.probe(target(), 1472, true);
    assert!(result.needs_fragmentation());
    assert_eq!(result.next_hop_mtu(), Some(1428));

    // Without DF the same size gets through
    assert!(prober.probe(target(), 1472, false).is_success());
}

#[test]
fn test_stray_replies_are_ignored() {
    let path = SimulatedPath::new(TARGET, Some(1472));
    // Reply to another process's ping, and one from a different host
    let foreign = build_echo_request(IDENTIFIER.wrapping_add(1), 7, 64, false);
    path.inject(echo_reply(&foreign, TARGET), target());
    let other_host = Ipv4Addr::new(10, 96, 0, 9);
    let ours_elsewhere = build_echo_request(IDENTIFIER, 7, 64, false);
    path.inject(echo_reply(&ours_elsewhere, other_host), IpAddr::V4(other_host));

    let prober = prober(path, Duration::from_secs(1));
    let result = prober.probe(target(), 64, true);
    assert!(result.is_success(), "got {:?}", result);
}

#[test]
fn test_black_hole_times_out_within_bound() {
    let timeout = Duration::from_millis(300);
    let prober = prober(SimulatedPath::new(TARGET, None), timeout);

    let started = Instant::now();
    let result = prober.probe(target(), 64, true);
    let elapsed = started.elapsed();

    assert!(matches!(result, ProbeResult::Timeout), "got {:?}", result);
    assert!(elapsed >= timeout - Duration::from_millis(50), "returned early: {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(500), "blocked too long: {:?}", elapsed);
}

#[test]
fn test_pmtu_finds_1400_behind_small_link() {
    let prober = prober(SimulatedPath::new(TARGET, Some(1400)), Duration::from_millis(200));
    let result = discover_pmtu(&prober, target(), &PmtuConfig::default(), &CancellationToken::new())
        .unwrap();
    assert_eq!(result.payload_size, 1400);
    assert_eq!(result.mtu, 1428);
}

#[test]
fn test_pmtu_clean_path_reports_upper_bound() {
    let config = PmtuConfig::default();
    let path = Arc::new(SimulatedPath::new(TARGET, Some(9000)));
    let prober = IcmpProber::with_channel(SharedPath(Arc::clone(&path)), Duration::from_millis(200))
        .with_identifier(IDENTIFIER);
    let result = discover_pmtu(&prober, target(), &config, &CancellationToken::new()).unwrap();

    assert_eq!(result.payload_size, 1472);
    assert!(result.probes as usize <= search_bound(&config));
    assert!(path.sent().iter().all(|&(size, _)| size <= config.upper));
}

#[test]
fn test_pmtu_converges_and_never_exceeds_a_failing_size() {
    let config = PmtuConfig::default();
    let bound = search_bound(&config);

    assert_eq!(bound, 11);

    for limit in [40, 41, 68, 500, 1000, 1280, 1399, 1400, 1450, 1471] {
        let path = Arc::new(SimulatedPath::new(TARGET, Some(limit)));
        let prober = IcmpProber::with_channel(SharedPath(Arc::clone(&path)), Duration::from_millis(200))
            .with_identifier(IDENTIFIER);

        let result = discover_pmtu(&prober, target(), &config, &CancellationToken::new()).unwrap();
        let sent = path.sent();

        assert_eq!(result.payload_size, limit);
        assert!(sent.len() <= bound, "limit {}: {} sent > {}", limit, sent.len(), bound);
        assert_eq!(result.probes as usize, sent.len());
        assert!(sent.iter().all(|&(_, df)| df));

        let smallest_failure = sent.iter().map(|&(size, _)| size).filter(|&s| s > limit).min();
        if let Some(failing) = smallest_failure {
            assert!(result.payload_size < failing);
        }
    }
}

#[test]
fn test_pmtu_reported_mtu_is_used() {
    let mut path = SimulatedPath::new(TARGET, Some(1400));
    path.report_mtu = true;
    let prober = prober(path, Duration::from_millis(200));
    let result = discover_pmtu(&prober, target(), &PmtuConfig::default(), &CancellationToken::new())
        .unwrap();
    assert_eq!(result.payload_size, 1400);
    // Bisection alone needs 11 sends for this limit
    assert!(result.probes < 11, "{} sent", result.probes);
}

#[test]
fn test_pmtu_minimum_failure_is_error() {
    let prober = prober(SimulatedPath::new(TARGET, Some(20)), Duration::from_millis(200));
    let err = discover_pmtu(&prober, target(), &PmtuConfig::default(), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, ProbeError::NoUsableMtu { lower: 40, upper: 1472 }));
}

#[test]
fn test_pmtu_black_hole_treats_timeouts_as_too_large() {
    let config = PmtuConfig {
        lower: 1000,
        upper: 1010,
    };
    let timeout = Duration::from_millis(20);
    let prober = prober(SimulatedPath::new(TARGET, None), timeout);

    let started = Instant::now();
    let err = discover_pmtu(&prober, target(), &config, &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ProbeError::NoUsableMtu { .. }));
    // Every send is bounded, so the run is too
    let budget = timeout * search_bound(&config) as u32 + Duration::from_secs(1);
    assert!(started.elapsed() < budget);
}

#[tokio::test]
async fn test_path_mtu_check_through_context() {
    let path = SimulatedPath::new(TARGET, Some(1400));
    let prober: Arc<dyn EchoProber> =
        Arc::new(IcmpProber::with_channel(path, Duration::from_millis(200)));
    let ctx = CheckContext::new(Config::default(), Ok(prober), CancellationToken::new())
        .unwrap()
        .with_local_interfaces(Vec::new());

    let mut tally = CheckTally::new();
    let report = path_mtu(&ctx, target(), &mut tally).await;
    assert_eq!(report.outcome, CheckOutcome::Pass);
    assert!(report.details[0].contains("1428"));
    assert_eq!(tally.passed(), 1);
}

#[test]
fn test_router_address_reported_for_frag_needed() {
    // The answer comes from the router, not the target, and is still matched
    let prober = prober(SimulatedPath::new(TARGET, Some(576)), Duration::from_secs(1));
    let result = prober.probe(target(), 1000, true);
    assert!(result.needs_fragmentation(), "got {:?}", result);
    assert_eq!(result.next_hop_mtu(), None);
}

/// Lets a test keep a handle on the path while the prober owns the channel
struct SharedPath(Arc<SimulatedPath>);

impl k8snetlook::probe::IcmpChannel for SharedPath {
    fn send(&self, packet: &[u8], target: IpAddr, dont_fragment: bool) -> std::io::Result<usize> {
        self.0.send(packet, target, dont_fragment)
    }

    fn recv(&self, ipv6: bool, buf: &mut [u8], timeout: Duration) -> std::io::Result<(usize, IpAddr)> {
        self.0.recv(ipv6, buf, timeout)
    }
}
