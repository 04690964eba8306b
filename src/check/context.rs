use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ProbeError;
use crate::probe::{
    EchoProber, EchoReply, HttpProber, LocalInterface, PathMtu, ProbeResult, discover_pmtu,
    local_interfaces,
};

/// Everything a check needs: configuration, probers and the run's
/// cancellation token.
///
/// The ICMP prober is optional. Without raw-socket capability the ICMP checks
/// still run and fail with the reason the capability was refused.
pub struct CheckContext {
    pub config: Config,
    pub gateway: Option<IpAddr>,
    icmp: Result<Arc<dyn EchoProber>, String>,
    http: HttpProber,
    interfaces: Option<Vec<LocalInterface>>,
    cancel: CancellationToken,
}

impl CheckContext {
    pub fn new(
        config: Config,
        icmp: Result<Arc<dyn EchoProber>, ProbeError>,
        cancel: CancellationToken,
    ) -> Result<Self, ProbeError> {
        let http = HttpProber::new(config.http_timeout)?;
        Ok(Self {
            gateway: config.gateway,
            icmp: icmp.map_err(|e| e.to_string()),
            http,
            interfaces: None,
            cancel,
            config,
        })
    }

    pub fn with_gateway(mut self, gateway: Option<IpAddr>) -> Self {
        self.gateway = gateway;
        self
    }

    /// Use a fixed interface list instead of enumerating the host's
    pub fn with_local_interfaces(mut self, interfaces: Vec<LocalInterface>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn icmp_available(&self) -> bool {
        self.icmp.is_ok()
    }

    pub fn http(&self) -> &HttpProber {
        &self.http
    }

    pub(crate) fn local_interfaces(&self) -> Vec<LocalInterface> {
        self.interfaces.clone().unwrap_or_else(local_interfaces)
    }

    fn icmp_prober(&self) -> Result<Arc<dyn EchoProber>, ProbeError> {
        self.icmp
            .as_ref()
            .map(Arc::clone)
            .map_err(|reason| ProbeError::PermissionDenied(reason.clone()))
    }

    /// One DF-controlled echo, run on the blocking pool
    pub async fn echo(&self, target: IpAddr, payload_size: usize, dont_fragment: bool) -> ProbeResult<EchoReply> {
        let prober = match self.icmp_prober() {
            Ok(prober) => prober,
            Err(e) => return ProbeResult::Failure(e),
        };
        tokio::task::spawn_blocking(move || prober.probe(target, payload_size, dont_fragment))
            .await
            .unwrap_or_else(|e| ProbeResult::Failure(ProbeError::Io(std::io::Error::other(e))))
    }

    /// A whole path MTU discovery run, on the blocking pool
    pub async fn discover_pmtu(&self, target: IpAddr) -> Result<PathMtu, ProbeError> {
        let prober = self.icmp_prober()?;
        let config = self.config.pmtu;
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || discover_pmtu(prober.as_ref(), target, &config, &cancel))
            .await
            .map_err(|e| ProbeError::Io(std::io::Error::other(e)))?
    }
}
