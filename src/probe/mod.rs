//! Network probe primitives: ICMP echo, HTTP status, DNS and path MTU discovery.
//!
//! Probes never print; they return typed results and leave presentation to
//! the check layer.

pub mod correlate;
pub mod dns;
pub mod http;
pub mod icmp;
pub mod interface;
pub mod pmtu;
pub mod socket;

pub use correlate::*;
pub use dns::*;
pub use http::*;
pub use icmp::*;
pub use interface::*;
pub use pmtu::*;
pub use socket::*;

use crate::error::ProbeError;

/// Outcome of one probe.
#[must_use]
#[derive(Debug)]
pub enum ProbeResult<T> {
    /// A matching answer arrived
    Success(T),
    /// An answer or local error proved the probe failed
    Failure(ProbeError),
    /// Nothing matching arrived before the deadline
    Timeout,
}

impl<T> ProbeResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success(_))
    }

    /// True for Frag Needed / Packet Too Big answers and local EMSGSIZE
    pub fn needs_fragmentation(&self) -> bool {
        matches!(
            self,
            ProbeResult::Failure(ProbeError::NeedsFragmentation { .. })
        )
    }

    /// Next-hop MTU reported alongside a fragmentation-needed failure
    pub fn next_hop_mtu(&self) -> Option<u16> {
        match self {
            ProbeResult::Failure(ProbeError::NeedsFragmentation { next_hop_mtu }) => *next_hop_mtu,
            _ => None,
        }
    }

    /// Collapse into a `Result`, turning `Timeout` into `ProbeError::Timeout`
    pub fn into_result(self) -> Result<T, ProbeError> {
        match self {
            ProbeResult::Success(value) => Ok(value),
            ProbeResult::Failure(err) => Err(err),
            ProbeResult::Timeout => Err(ProbeError::Timeout),
        }
    }
}

impl<T> From<Result<T, ProbeError>> for ProbeResult<T> {
    fn from(result: Result<T, ProbeError>) -> Self {
        match result {
            Ok(value) => ProbeResult::Success(value),
            Err(ProbeError::Timeout) => ProbeResult::Timeout,
            Err(err) => ProbeResult::Failure(err),
        }
    }
}
