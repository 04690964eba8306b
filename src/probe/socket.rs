use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProbeError;

/// Transport for ICMP echo probes.
///
/// The production implementation is [`RawIcmpChannel`]; tests substitute
/// scripted responders.
pub trait IcmpChannel: Send + Sync {
    /// Send a complete ICMP message to `target`, with or without the DF bit
    fn send(&self, packet: &[u8], target: IpAddr, dont_fragment: bool) -> io::Result<usize>;

    /// Receive one packet of the given family, waiting at most `timeout`.
    ///
    /// IPv4 packets start at the IP header, IPv6 packets at the ICMPv6 header.
    /// Expiry is reported as `WouldBlock` or `TimedOut`.
    fn recv(&self, ipv6: bool, buf: &mut [u8], timeout: Duration) -> io::Result<(usize, IpAddr)>;
}

/// Raw ICMP sockets for both address families.
///
/// Holding one of these is the capability to send ICMP; it can only be
/// obtained through [`RawIcmpChannel::open`].
#[derive(Debug)]
pub struct RawIcmpChannel {
    v4: Socket,
    v6: Option<Socket>,
    // DF is a socket option, so setting it and sending must not interleave
    send_lock: Mutex<()>,
}

impl RawIcmpChannel {
    /// Acquire raw ICMP sockets.
    ///
    /// Fails with `PermissionDenied` when the process lacks CAP_NET_RAW/root.
    /// IPv6 is best-effort: hosts without IPv6 still get an IPv4 channel.
    pub fn open() -> Result<Self, ProbeError> {
        let v4 = create_raw_icmp_socket(false).map_err(|e| {
            let binary_path = std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "k8snetlook".to_string());
            ProbeError::PermissionDenied(format!(
                "{}\n\n\
                 Fix options:\n\
                 \u{2022} Run as root: sudo k8snetlook ...\n\
                 \u{2022} Add capability: sudo setcap cap_net_raw+ep {}\n\
                 \u{2022} In a pod: add NET_RAW to securityContext.capabilities",
                e, binary_path
            ))
        })?;

        let v6 = match create_raw_icmp_socket(true) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("IPv6 raw ICMP socket unavailable: {}", e);
                None
            }
        };

        Ok(Self {
            v4,
            v6,
            send_lock: Mutex::new(()),
        })
    }

    fn socket(&self, ipv6: bool) -> io::Result<&Socket> {
        if ipv6 {
            self.v6.as_ref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::Unsupported, "IPv6 ICMP socket unavailable")
            })
        } else {
            Ok(&self.v4)
        }
    }
}

impl IcmpChannel for RawIcmpChannel {
    fn send(&self, packet: &[u8], target: IpAddr, dont_fragment: bool) -> io::Result<usize> {
        let ipv6 = target.is_ipv6();
        let socket = self.socket(ipv6)?;
        let _guard = self.send_lock.lock();
        set_dont_fragment(socket, ipv6, dont_fragment)?;
        send_icmp(socket, packet, target)
    }

    fn recv(&self, ipv6: bool, buf: &mut [u8], timeout: Duration) -> io::Result<(usize, IpAddr)> {
        let socket = self.socket(ipv6)?;
        // A zero read timeout means "block forever" to the kernel
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        recv_icmp(socket, buf)
    }
}

/// Create a raw ICMP socket
pub fn create_raw_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let protocol = if ipv6 {
        Protocol::ICMPV6
    } else {
        Protocol::ICMPV4
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;
    if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
        debug!("Could not set receive buffer to 1MB: {}", e);
    }

    Ok(socket)
}

#[cfg(unix)]
fn setsockopt_int(
    socket: &Socket,
    level: libc::c_int,
    optname: libc::c_int,
    val: libc::c_int,
) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            optname,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set or clear the Don't Fragment flag
/// - IPv4: IP_MTU_DISCOVER = IP_PMTUDISC_DO (DF set) or IP_PMTUDISC_DONT (DF clear)
/// - IPv6: IPV6_DONTFRAG = 1/0 (routers never fragment IPv6; this stops the source)
#[cfg(target_os = "linux")]
pub fn set_dont_fragment(socket: &Socket, ipv6: bool, enabled: bool) -> io::Result<()> {
    if ipv6 {
        // IPV6_DONTFRAG = 62 on Linux
        const IPV6_DONTFRAG: libc::c_int = 62;
        setsockopt_int(socket, libc::IPPROTO_IPV6, IPV6_DONTFRAG, enabled as libc::c_int)
    } else {
        // IP_MTU_DISCOVER = 10, IP_PMTUDISC_DONT = 0, IP_PMTUDISC_DO = 2 on Linux
        const IP_MTU_DISCOVER: libc::c_int = 10;
        const IP_PMTUDISC_DONT: libc::c_int = 0;
        const IP_PMTUDISC_DO: libc::c_int = 2;
        let val = if enabled {
            IP_PMTUDISC_DO
        } else {
            IP_PMTUDISC_DONT
        };
        setsockopt_int(socket, libc::IPPROTO_IP, IP_MTU_DISCOVER, val)
    }
}

/// Set or clear the Don't Fragment flag (macOS)
/// - IPv4: IP_DONTFRAG = 1/0
/// - IPv6: IPV6_DONTFRAG = 1/0
#[cfg(target_os = "macos")]
pub fn set_dont_fragment(socket: &Socket, ipv6: bool, enabled: bool) -> io::Result<()> {
    if ipv6 {
        // IPV6_DONTFRAG = 62 on macOS
        const IPV6_DONTFRAG: libc::c_int = 62;
        setsockopt_int(socket, libc::IPPROTO_IPV6, IPV6_DONTFRAG, enabled as libc::c_int)
    } else {
        // IP_DONTFRAG = 28 on macOS
        const IP_DONTFRAG: libc::c_int = 28;
        setsockopt_int(socket, libc::IPPROTO_IP, IP_DONTFRAG, enabled as libc::c_int)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn set_dont_fragment(_socket: &Socket, _ipv6: bool, enabled: bool) -> io::Result<()> {
    if enabled {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Don't Fragment is only supported on Linux and macOS",
        ));
    }
    Ok(())
}

/// Send ICMP packet to target
pub fn send_icmp(socket: &Socket, packet: &[u8], target: IpAddr) -> io::Result<usize> {
    let addr = SockAddr::from(SocketAddr::new(target, 0));
    socket.send_to(packet, &addr)
}

/// Receive one ICMP packet and its source address
pub fn recv_icmp(socket: &Socket, buffer: &mut [u8]) -> io::Result<(usize, IpAddr)> {
    // SAFETY: recv_from only writes initialized bytes into the buffer, and
    // u8 has no invalid bit patterns.
    let uninit =
        unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let (len, addr) = socket.recv_from(uninit)?;
    let source = addr
        .as_socket()
        .map(|s| s.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Unknown address family"))?;
    Ok((len, source))
}

/// True when a send failed because the packet exceeds the known path MTU with DF set
pub fn is_message_too_long(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EMSGSIZE)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
