//! Host network facts: the default gateway and local interface MTUs.
//!
//! - Gateway: parsed from `ip route` (Linux) or `route -n get` (macOS)
//! - Interfaces: enumerated with `pnet::datalink`; MTU read from sysfs on Linux

use pnet::datalink;
use serde::Serialize;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

/// A local interface and its configured MTU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalInterface {
    pub name: String,
    pub is_loopback: bool,
    /// None when the platform does not expose it
    pub mtu: Option<usize>,
}

/// Detect the default gateway from the routing table.
///
/// Returns None if the route command fails or there is no default route.
pub fn detect_default_gateway(ipv6: bool) -> Option<IpAddr> {
    #[cfg(target_os = "linux")]
    {
        let args: &[&str] = if ipv6 {
            &["-6", "route", "show", "default"]
        } else {
            &["route", "show", "default"]
        };
        let output = std::process::Command::new("ip").args(args).output().ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let gateway = if ipv6 {
            parse_linux_route_gateway::<std::net::Ipv6Addr>(&stdout).map(IpAddr::V6)
        } else {
            parse_linux_route_gateway::<std::net::Ipv4Addr>(&stdout).map(IpAddr::V4)
        };
        debug!(?gateway, "default gateway from ip route");
        gateway
    }

    #[cfg(target_os = "macos")]
    {
        let args: &[&str] = if ipv6 {
            &["-n", "get", "-inet6", "default"]
        } else {
            &["-n", "get", "default"]
        };
        let output = std::process::Command::new("route").args(args).output().ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let gateway = if ipv6 {
            parse_macos_route_gateway::<std::net::Ipv6Addr>(&stdout).map(IpAddr::V6)
        } else {
            parse_macos_route_gateway::<std::net::Ipv4Addr>(&stdout).map(IpAddr::V4)
        };
        debug!(?gateway, "default gateway from route -n get");
        gateway
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = ipv6;
        None
    }
}

/// Gateway from `ip route show default` output.
///
/// Example: "default via 192.168.1.1 dev eth0 proto dhcp metric 100".
/// IPv6 gateways may carry a `%iface` zone suffix, which is dropped.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux_route_gateway<A: FromStr>(output: &str) -> Option<A> {
    output
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            parts.find(|&p| p == "via")?;
            let addr = parts.next()?;
            addr.split('%').next()?.parse().ok()
        })
}

/// Gateway from `route -n get default` output:
///
/// ```text
///    route to: default
/// destination: default
///     gateway: 192.168.1.1
///   interface: en0
/// ```
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_macos_route_gateway<A: FromStr>(output: &str) -> Option<A> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("gateway:")?;
        rest.trim().split('%').next()?.parse().ok()
    })
}

/// All local interfaces with their MTU
pub fn local_interfaces() -> Vec<LocalInterface> {
    datalink::interfaces()
        .into_iter()
        .map(|iface| LocalInterface {
            mtu: interface_mtu(&iface.name),
            is_loopback: iface.is_loopback(),
            name: iface.name,
        })
        .collect()
}

/// Non-loopback interfaces whose MTU is larger than `path_mtu`.
///
/// Packets those interfaces emit at full size cannot cross the path without
/// fragmentation.
pub fn interfaces_exceeding(interfaces: &[LocalInterface], path_mtu: usize) -> Vec<LocalInterface> {
    interfaces
        .iter()
        .filter(|iface| !iface.is_loopback)
        .filter(|iface| iface.mtu.is_some_and(|mtu| mtu > path_mtu))
        .cloned()
        .collect()
}

#[cfg(target_os = "linux")]
fn interface_mtu(name: &str) -> Option<usize> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{}/mtu", name)).ok()?;
    parse_mtu(&raw)
}

#[cfg(not(target_os = "linux"))]
fn interface_mtu(_name: &str) -> Option<usize> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mtu(raw: &str) -> Option<usize> {
    raw.trim().parse().ok().filter(|&mtu| mtu > 0)
}
