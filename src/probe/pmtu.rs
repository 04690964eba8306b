//! Path MTU discovery by bisecting ICMP payload sizes with DF set.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::probe::ProbeResult;
use crate::probe::icmp::{EchoProber, ICMP_HEADER_SIZE};

pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;

/// Smallest payload searched by default (68-byte IPv4 minimum MTU)
pub const DEFAULT_PMTU_LOWER: usize = 40;
/// Largest payload searched by default (1500-byte Ethernet MTU)
pub const DEFAULT_PMTU_UPPER: usize = 1472;

/// IP-level packet size for an ICMP echo with this payload
pub fn payload_to_mtu(payload_size: usize, ipv6: bool) -> usize {
    let ip_header = if ipv6 {
        IPV6_HEADER_SIZE
    } else {
        IPV4_HEADER_SIZE
    };
    payload_size + ICMP_HEADER_SIZE + ip_header
}

/// Largest ICMP echo payload that fits in a packet of `mtu` bytes
pub fn mtu_to_payload(mtu: usize, ipv6: bool) -> usize {
    let ip_header = if ipv6 {
        IPV6_HEADER_SIZE
    } else {
        IPV4_HEADER_SIZE
    };
    mtu.saturating_sub(ICMP_HEADER_SIZE + ip_header)
}

/// Payload bounds for one discovery run (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmtuConfig {
    pub lower: usize,
    pub upper: usize,
}

impl Default for PmtuConfig {
    fn default() -> Self {
        Self {
            lower: DEFAULT_PMTU_LOWER,
            upper: DEFAULT_PMTU_UPPER,
        }
    }
}

/// Search state for one discovery run.
///
/// Sizes in `lower..=upper` are still untested. Everything below `lower` is
/// either below the configured minimum or known to work; everything above
/// `upper` is known (or reported) to be too large.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtuSearchState {
    pub lower: usize,
    pub upper: usize,
    pub current: usize,
    pub last_good: Option<usize>,
}

impl MtuSearchState {
    pub fn new(lower: usize, upper: usize) -> Self {
        Self {
            lower,
            upper,
            current: upper,
            last_good: None,
        }
    }

    /// No untested sizes remain
    pub fn is_done(&self) -> bool {
        self.lower > self.upper
    }

    /// Pick the midpoint of the untested interval as the next probe size
    pub fn next_size(&mut self) -> usize {
        self.current = self.lower + (self.upper - self.lower) / 2;
        self.current
    }

    pub fn record_success(&mut self) {
        self.last_good = Some(self.current);
        self.lower = self.current + 1;
    }

    /// `current` is too large. A payload hint derived from a reported
    /// next-hop MTU tightens the upper bound further when it is plausible.
    pub fn record_too_large(&mut self, hint: Option<usize>) {
        match self.current.checked_sub(1) {
            Some(upper) => self.upper = upper,
            None => {
                self.lower = 1;
                self.upper = 0;
                return;
            }
        }
        if let Some(hint) = hint
            && hint >= self.lower
            && hint < self.upper
        {
            self.upper = hint;
        }
    }
}

/// Result of a successful discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMtu {
    /// Largest ICMP payload that got through with DF set
    pub payload_size: usize,
    /// The same size as an IP packet (payload + ICMP + IP headers)
    pub mtu: usize,
    /// Echo requests sent to find it
    pub probes: u32,
}

/// Find the largest DF-set ICMP payload `target` answers.
///
/// Bisects `lower..=upper`. Frag Needed and timeouts both mean "too large";
/// a next-hop MTU reported with Frag Needed narrows the interval further.
/// Any other failure (host unreachable, socket errors) is not size related
/// and ends the run with that error.
///
/// At most `ceil(log2(upper - lower + 2))` probes are sent, 11 for the
/// default 40..=1472.
pub fn discover_pmtu<P: EchoProber + ?Sized>(
    prober: &P,
    target: IpAddr,
    config: &PmtuConfig,
    cancel: &CancellationToken,
) -> Result<PathMtu, ProbeError> {
    if config.lower > config.upper {
        return Err(ProbeError::InvalidArgument(format!(
            "PMTU lower bound {} is above upper bound {}",
            config.lower, config.upper
        )));
    }

    let ipv6 = target.is_ipv6();
    let mut probes = 0u32;
    let mut state = MtuSearchState::new(config.lower, config.upper);

    while !state.is_done() {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let size = state.next_size();
        probes += 1;
        match prober.probe(target, size, true) {
            ProbeResult::Success(_) => {
                debug!(%target, size, "payload fits");
                state.record_success();
            }
            ProbeResult::Failure(ProbeError::NeedsFragmentation { next_hop_mtu }) => {
                debug!(%target, size, ?next_hop_mtu, "payload needs fragmentation");
                state.record_too_large(next_hop_mtu.map(|mtu| mtu_to_payload(mtu as usize, ipv6)));
            }
            ProbeResult::Timeout => {
                debug!(%target, size, "no answer, treating payload as too large");
                state.record_too_large(None);
            }
            ProbeResult::Failure(err) => return Err(err),
        }
        debug!(lower = state.lower, upper = state.upper, last_good = ?state.last_good, "search bounds");
    }

    let payload_size = state.last_good.ok_or(ProbeError::NoUsableMtu {
        lower: config.lower,
        upper: config.upper,
    })?;

    info!(%target, payload_size, probes, "path MTU discovered");
    Ok(PathMtu {
        payload_size,
        mtu: payload_to_mtu(payload_size, ipv6),
        probes,
    })
}
