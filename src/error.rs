//! Error types for probe operations.

use thiserror::Error;

/// Errors produced by the probe engine.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Timed out waiting for a response")]
    Timeout,

    #[error("Destination unreachable (ICMP code {code})")]
    Unreachable { code: u8 },

    #[error("Time exceeded in transit (reported by {responder})")]
    TimeExceeded { responder: std::net::IpAddr },

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Fragmentation needed{}", .next_hop_mtu.map(|m| format!(" (next-hop MTU {})", m)).unwrap_or_default())]
    NeedsFragmentation { next_hop_mtu: Option<u16> },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Insufficient permissions for raw ICMP sockets: {0}")]
    PermissionDenied(String),

    #[error("No addresses returned for {name}")]
    NoResolution { name: String },

    #[error("Name {name} does not exist ({rcode})")]
    NameNotFound { name: String, rcode: String },

    #[error("No usable MTU found between payload sizes {lower} and {upper}")]
    NoUsableMtu { lower: usize, upper: usize },

    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ProbeError {
    /// Per-probe errors that the orchestrator records as a failed check and moves past.
    ///
    /// `PermissionDenied` is the only error that means a whole class of checks
    /// cannot run; everything else is local to one probe.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::PermissionDenied(_) | Self::Cancelled | Self::InvalidArgument(_)
        )
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ProbeError::Timeout,
            std::io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused,
            std::io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(err.to_string()),
            _ => ProbeError::Io(err),
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProbeError::Timeout;
        }
        if err.is_connect() && refused_in_chain(&err) {
            return ProbeError::ConnectionRefused;
        }
        ProbeError::Http(err)
    }
}

fn refused_in_chain(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::ConnectionRefused
        {
            return true;
        }
        source = cause.source();
    }
    false
}
