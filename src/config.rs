use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;
use crate::probe::{
    DEFAULT_DNS_TIMEOUT, DEFAULT_HTTP_TIMEOUT, DEFAULT_ICMP_TIMEOUT, DEFAULT_PAYLOAD_SIZE, DNS_PORT, MAX_PAYLOAD_SIZE,
    PmtuConfig,
};

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_APISERVER_PORT: u16 = 443;

/// Service whose cluster DNS record is checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub name: String,
    pub namespace: String,
    /// ClusterIP the record must contain
    pub expected_ip: Ipv4Addr,
}

impl ServiceTarget {
    /// `<name>.<namespace>.svc.<domain>.`
    pub fn fqdn(&self, cluster_domain: &str) -> String {
        format!(
            "{}.{}.svc.{}.",
            self.name,
            self.namespace,
            cluster_domain.trim_end_matches('.')
        )
    }
}

/// Runtime configuration derived from CLI args, the config file and the
/// pod environment (in that order of precedence)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Wait for one ICMP reply
    #[serde(with = "duration_serde")]
    pub icmp_timeout: Duration,
    /// Whole HTTP exchange
    #[serde(with = "duration_serde")]
    pub http_timeout: Duration,
    /// Whole DNS exchange, TCP retry included
    #[serde(with = "duration_serde")]
    pub dns_timeout: Duration,
    /// ICMP payload for reachability checks
    pub payload_size: usize,
    pub pmtu: PmtuConfig,
    /// Run path MTU discovery against each destination
    pub pmtu_enabled: bool,
    /// Host gateway; detected from the routing table when unset
    pub gateway: Option<IpAddr>,
    pub destinations: Vec<IpAddr>,
    /// Kubernetes API service address (ClusterIP:port)
    pub apiserver: Option<SocketAddr>,
    /// API server endpoint addresses behind the service
    pub endpoints: Vec<SocketAddr>,
    pub dns_server: Option<IpAddr>,
    pub dns_port: u16,
    pub dns_target: Option<ServiceTarget>,
    pub cluster_domain: String,
    pub token_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            icmp_timeout: DEFAULT_ICMP_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            pmtu: PmtuConfig::default(),
            pmtu_enabled: true,
            gateway: None,
            destinations: Vec::new(),
            apiserver: None,
            endpoints: Vec::new(),
            dns_server: None,
            dns_port: DNS_PORT,
            dns_target: None,
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            token_path: PathBuf::from(DEFAULT_TOKEN_PATH),
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Config::from_sources(args, &FileConfig::default(), |key| std::env::var(key).ok())
    }
}

impl Config {
    /// Merge CLI args over file settings over environment.
    ///
    /// `env` looks up variables such as `KUBERNETES_SERVICE_HOST`.
    pub fn from_sources<F>(args: &Args, file: &FileConfig, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let secs = |cli: Option<f64>, file: Option<f64>, default: Duration| {
            cli.or(file)
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .unwrap_or(default)
        };

        let apiserver_ip = args
            .apiserver_ip
            .or(file.apiserver_ip)
            .or_else(|| env("KUBERNETES_SERVICE_HOST").and_then(|v| v.trim().parse().ok()));
        let apiserver_port = args
            .apiserver_port
            .or(file.apiserver_port)
            .or_else(|| env("KUBERNETES_SERVICE_PORT").and_then(|v| v.trim().parse().ok()))
            .unwrap_or(DEFAULT_APISERVER_PORT);

        let dns_target = match (&args.svc_name, &args.svc_namespace, args.svc_ip) {
            (Some(name), Some(namespace), Some(expected_ip)) => Some(ServiceTarget {
                name: name.clone(),
                namespace: namespace.clone(),
                expected_ip,
            }),
            _ => file.dns_target.clone(),
        };

        Self {
            icmp_timeout: secs(args.icmp_timeout, file.icmp_timeout, defaults.icmp_timeout),
            http_timeout: secs(args.http_timeout, file.http_timeout, defaults.http_timeout),
            dns_timeout: secs(args.dns_timeout, file.dns_timeout, defaults.dns_timeout),
            payload_size: args
                .payload_size
                .or(file.payload_size)
                .unwrap_or(defaults.payload_size),
            pmtu: PmtuConfig {
                lower: args.pmtu_min.or(file.pmtu_min).unwrap_or(defaults.pmtu.lower),
                upper: args.pmtu_max.or(file.pmtu_max).unwrap_or(defaults.pmtu.upper),
            },
            pmtu_enabled: !args.no_pmtu && file.pmtu_enabled.unwrap_or(true),
            gateway: args.gateway.or(file.gateway),
            destinations: if args.destinations.is_empty() {
                file.destinations.clone()
            } else {
                args.destinations.clone()
            },
            apiserver: apiserver_ip.map(|ip| SocketAddr::new(ip, apiserver_port)),
            endpoints: if args.endpoints.is_empty() {
                file.endpoints.clone()
            } else {
                args.endpoints.clone()
            },
            dns_server: args.dns_server.or(file.dns_server),
            dns_port: args.dns_port.or(file.dns_port).unwrap_or(defaults.dns_port),
            dns_target,
            cluster_domain: args
                .cluster_domain
                .clone()
                .or_else(|| file.cluster_domain.clone())
                .unwrap_or(defaults.cluster_domain),
            token_path: args
                .token_path
                .clone()
                .or_else(|| file.token_path.clone())
                .unwrap_or(defaults.token_path),
        }
    }
}

/// Optional settings file, ~/.config/k8snetlook/config.toml by default.
///
/// Every key is optional; CLI flags win over anything set here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub icmp_timeout: Option<f64>,
    pub http_timeout: Option<f64>,
    pub dns_timeout: Option<f64>,
    pub payload_size: Option<usize>,
    pub pmtu_min: Option<usize>,
    pub pmtu_max: Option<usize>,
    pub pmtu_enabled: Option<bool>,
    pub gateway: Option<IpAddr>,
    pub destinations: Vec<IpAddr>,
    pub apiserver_ip: Option<IpAddr>,
    pub apiserver_port: Option<u16>,
    pub endpoints: Vec<SocketAddr>,
    pub dns_server: Option<IpAddr>,
    pub dns_port: Option<u16>,
    pub dns_target: Option<ServiceTarget>,
    pub cluster_domain: Option<String>,
    pub token_path: Option<PathBuf>,
}

impl FileConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("k8snetlook").join("config.toml"))
    }

    /// Parse a settings file. Unlike the default location, an explicit path
    /// must exist and parse.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: Self = toml::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        file.validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path.display(), e))?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), String> {
        for (key, value) in [
            ("icmp_timeout", self.icmp_timeout),
            ("http_timeout", self.http_timeout),
            ("dns_timeout", self.dns_timeout),
        ] {
            if let Some(secs) = value
                && !(secs.is_finite() && secs > 0.0)
            {
                return Err(format!("{} must be a positive number of seconds", key));
            }
        }

        for (key, value) in [("payload_size", self.payload_size), ("pmtu_max", self.pmtu_max)] {
            if let Some(size) = value
                && size > MAX_PAYLOAD_SIZE
            {
                return Err(format!("{} cannot exceed {}", key, MAX_PAYLOAD_SIZE));
            }
        }
        if let (Some(min), Some(max)) = (self.pmtu_min, self.pmtu_max)
            && min > max
        {
            return Err(format!("pmtu_min ({}) is larger than pmtu_max ({})", min, max));
        }
        Ok(())
    }

    /// Load the default file if present; a missing file is an empty config
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
