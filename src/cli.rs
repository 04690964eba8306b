use clap::{ArgAction, Parser};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::probe::MAX_PAYLOAD_SIZE;

/// Kubernetes pod/node network diagnostics: gateway, API server, DNS and path MTU checks
#[derive(Parser, Debug, Clone)]
#[command(name = "k8snetlook")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host gateway to ping (default: detected from the routing table)
    #[arg(long = "gateway")]
    pub gateway: Option<IpAddr>,

    /// Destination IP for connectivity and path MTU checks (repeatable)
    #[arg(short = 'd', long = "dst")]
    pub destinations: Vec<IpAddr>,

    /// Kubernetes API service IP (default: $KUBERNETES_SERVICE_HOST)
    #[arg(long = "apiserver-ip")]
    pub apiserver_ip: Option<IpAddr>,

    /// Kubernetes API service port (default: $KUBERNETES_SERVICE_PORT or 443)
    #[arg(long = "apiserver-port")]
    pub apiserver_port: Option<u16>,

    /// API server endpoint behind the service, as IP:PORT (repeatable)
    #[arg(long = "endpoint")]
    pub endpoints: Vec<SocketAddr>,

    /// Cluster DNS server to query directly
    #[arg(long = "dns-server")]
    pub dns_server: Option<IpAddr>,

    /// Port of the cluster DNS server
    #[arg(long = "dns-port")]
    pub dns_port: Option<u16>,

    /// Service name for the DNS check
    #[arg(long = "svc-name", requires_all = ["svc_namespace", "svc_ip"])]
    pub svc_name: Option<String>,

    /// Service namespace for the DNS check
    #[arg(long = "svc-namespace", requires_all = ["svc_name", "svc_ip"])]
    pub svc_namespace: Option<String>,

    /// ClusterIP the service name must resolve to
    #[arg(long = "svc-ip", requires_all = ["svc_name", "svc_namespace"])]
    pub svc_ip: Option<Ipv4Addr>,

    /// Cluster DNS domain
    #[arg(long = "cluster-domain")]
    pub cluster_domain: Option<String>,

    /// Service account token used for the API server health check
    #[arg(long = "token-path")]
    pub token_path: Option<PathBuf>,

    /// ICMP reply timeout in seconds
    #[arg(long = "icmp-timeout")]
    pub icmp_timeout: Option<f64>,

    /// HTTP request timeout in seconds
    #[arg(long = "http-timeout")]
    pub http_timeout: Option<f64>,

    /// DNS query timeout in seconds
    #[arg(long = "dns-timeout")]
    pub dns_timeout: Option<f64>,

    /// ICMP payload size for connectivity checks
    #[arg(short = 's', long = "payload-size")]
    pub payload_size: Option<usize>,

    /// Smallest ICMP payload tried during path MTU discovery
    #[arg(long = "pmtu-min")]
    pub pmtu_min: Option<usize>,

    /// Largest ICMP payload tried during path MTU discovery
    #[arg(long = "pmtu-max")]
    pub pmtu_max: Option<usize>,

    /// Skip path MTU discovery
    #[arg(long = "no-pmtu")]
    pub no_pmtu: bool,

    /// Settings file (default: ~/.config/k8snetlook/config.toml)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Print the run as JSON instead of text
    #[arg(long = "json")]
    pub json: bool,

    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        for (flag, value) in [
            ("--icmp-timeout", self.icmp_timeout),
            ("--http-timeout", self.http_timeout),
            ("--dns-timeout", self.dns_timeout),
        ] {
            if let Some(secs) = value
                && !(secs.is_finite() && secs > 0.0)
            {
                return Err(format!("{} must be positive", flag));
            }
        }

        if let Some(size) = self.payload_size
            && size > MAX_PAYLOAD_SIZE
        {
            return Err(format!("Payload size cannot exceed {}", MAX_PAYLOAD_SIZE));
        }

        if let (Some(min), Some(max)) = (self.pmtu_min, self.pmtu_max)
            && min > max
        {
            return Err(format!("--pmtu-min ({}) is larger than --pmtu-max ({})", min, max));
        }
        if let Some(max) = self.pmtu_max
            && max > MAX_PAYLOAD_SIZE
        {
            return Err(format!("--pmtu-max cannot exceed {}", MAX_PAYLOAD_SIZE));
        }

        if let Some(ref domain) = self.cluster_domain
            && domain.trim_matches('.').is_empty()
        {
            return Err("Cluster domain cannot be empty".into());
        }

        Ok(())
    }
}
