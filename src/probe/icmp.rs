use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpType, IcmpTypes, checksum};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::ProbeError;
use crate::probe::ProbeResult;
use crate::probe::correlate::{IcmpResponseType, parse_icmp_response};
use crate::probe::socket::{IcmpChannel, RawIcmpChannel, is_message_too_long};

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Payload used for plain reachability checks
pub const DEFAULT_PAYLOAD_SIZE: usize = 64;
/// Largest ICMP payload that fits in an IPv4 datagram (65535 - 20 - 8)
pub const MAX_PAYLOAD_SIZE: usize = 65507;
/// Default time to wait for a reply
pub const DEFAULT_ICMP_TIMEOUT: Duration = Duration::from_secs(3);

/// Process identifier for the ICMP identification field
pub fn get_identifier() -> u16 {
    std::process::id() as u16
}

/// Build an ICMP Echo Request whose payload is exactly `payload_size` bytes.
///
/// Set ipv6=true to build an ICMPv6 Echo Request (the kernel fills in the
/// ICMPv6 checksum).
///
/// Payload layout:
/// - Bytes 0-1: identifier (when payload_size >= 2)
/// - Bytes 2-3: sequence (when payload_size >= 4)
/// - Bytes 4+: pattern fill
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    payload_size: usize,
    ipv6: bool,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];

    {
        // The buffer always holds at least the 8-byte header
        let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) else {
            return buffer;
        };

        if ipv6 {
            packet.set_icmp_type(IcmpType::new(128));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);

        let mut marker = [0u8; 4];
        marker[0..2].copy_from_slice(&identifier.to_be_bytes());
        marker[2..4].copy_from_slice(&sequence.to_be_bytes());

        let payload = packet.payload_mut();
        let embedded = payload.len().min(marker.len());
        payload[..embedded].copy_from_slice(&marker[..embedded]);
        for (i, byte) in payload[embedded..].iter_mut().enumerate() {
            *byte = (i & 0xFF) as u8;
        }
    }

    if !ipv6 {
        let cksum = IcmpPacket::new(&buffer).map(|p| checksum(&p));
        if let (Some(cksum), Some(mut packet)) =
            (cksum, MutableEchoRequestPacket::new(&mut buffer))
        {
            packet.set_checksum(cksum);
        }
    }

    buffer
}

/// A matched echo reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub responder: IpAddr,
    pub sequence: u16,
    pub payload_size: usize,
    pub rtt: Duration,
}

/// Anything that can send one echo request and classify the answer.
///
/// Path MTU discovery is written against this trait so it can run against
/// simulated networks.
pub trait EchoProber: Send + Sync {
    fn probe(&self, target: IpAddr, payload_size: usize, dont_fragment: bool)
    -> ProbeResult<EchoReply>;
}

/// ICMP echo prober over raw sockets.
///
/// Each probe gets its own sequence number; replies are accepted only if both
/// identifier and sequence match, so probes never pick up each other's answers.
pub struct IcmpProber<C = RawIcmpChannel> {
    channel: C,
    identifier: u16,
    next_sequence: AtomicU16,
    timeout: Duration,
}

impl IcmpProber<RawIcmpChannel> {
    /// Open raw ICMP sockets. Fails with `PermissionDenied` without CAP_NET_RAW.
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let channel = RawIcmpChannel::open()?;
        Ok(Self::with_channel(channel, timeout))
    }
}

impl<C: IcmpChannel> IcmpProber<C> {
    pub fn with_channel(channel: C, timeout: Duration) -> Self {
        Self {
            channel,
            identifier: get_identifier(),
            next_sequence: AtomicU16::new(rand::random()),
            timeout,
        }
    }

    /// Override the ICMP identifier (the process id by default)
    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one echo request and wait for the matching answer or the timeout.
    pub fn probe(
        &self,
        target: IpAddr,
        payload_size: usize,
        dont_fragment: bool,
    ) -> ProbeResult<EchoReply> {
        if payload_size > MAX_PAYLOAD_SIZE {
            return ProbeResult::Failure(ProbeError::InvalidArgument(format!(
                "ICMP payload of {} bytes exceeds maximum {}",
                payload_size, MAX_PAYLOAD_SIZE
            )));
        }

        let ipv6 = target.is_ipv6();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let packet = build_echo_request(self.identifier, sequence, payload_size, ipv6);

        debug!(%target, payload_size, dont_fragment, sequence, "sending echo request");

        let sent_at = Instant::now();
        if let Err(e) = self.channel.send(&packet, target, dont_fragment) {
            // The kernel already knows the path MTU is smaller
            if dont_fragment && is_message_too_long(&e) {
                debug!(%target, payload_size, "send rejected with EMSGSIZE");
                return ProbeResult::Failure(ProbeError::NeedsFragmentation { next_hop_mtu: None });
            }
            return ProbeResult::Failure(e.into());
        }

        self.await_reply(target, sequence, payload_size, sent_at)
    }

    fn await_reply(
        &self,
        target: IpAddr,
        sequence: u16,
        payload_size: usize,
        sent_at: Instant,
    ) -> ProbeResult<EchoReply> {
        let deadline = sent_at + self.timeout;
        let ipv6 = target.is_ipv6();
        let mut buffer = vec![0u8; (payload_size + 128).max(2048)];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return ProbeResult::Timeout;
            }

            let (len, source) = match self.channel.recv(ipv6, &mut buffer, deadline - now) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return ProbeResult::Timeout;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return ProbeResult::Failure(e.into()),
            };

            let Some(parsed) = parse_icmp_response(&buffer[..len], source, self.identifier) else {
                continue;
            };
            if parsed.sequence != sequence || parsed.original_dest != Some(target) {
                trace!(%source, seq = parsed.sequence, "ignoring response for another probe");
                continue;
            }

            return match parsed.response_type {
                IcmpResponseType::EchoReply => ProbeResult::Success(EchoReply {
                    responder: parsed.responder,
                    sequence,
                    payload_size,
                    rtt: sent_at.elapsed(),
                }),
                IcmpResponseType::DestUnreachable(code) if !parsed.response_type.is_frag_needed() => {
                    ProbeResult::Failure(ProbeError::Unreachable { code })
                }
                IcmpResponseType::TimeExceeded(_) => {
                    ProbeResult::Failure(ProbeError::TimeExceeded { responder: source })
                }
                // Frag Needed or Packet Too Big
                IcmpResponseType::DestUnreachable(_) | IcmpResponseType::PacketTooBig => {
                    debug!(%source, mtu = ?parsed.mtu, "fragmentation needed");
                    ProbeResult::Failure(ProbeError::NeedsFragmentation {
                        next_hop_mtu: parsed.mtu,
                    })
                }
            };
        }
    }
}

impl<C: IcmpChannel> EchoProber for IcmpProber<C> {
    fn probe(
        &self,
        target: IpAddr,
        payload_size: usize,
        dont_fragment: bool,
    ) -> ProbeResult<EchoReply> {
        IcmpProber::probe(self, target, payload_size, dont_fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(1234, 5678, DEFAULT_PAYLOAD_SIZE, false);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + DEFAULT_PAYLOAD_SIZE);
        assert_eq!(packet[0], 8); // Echo Request type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 5678);
    }

    #[test]
    fn test_build_echo_request_checksum_valid() {
        let packet = build_echo_request(0xBEEF, 42, 1472, false);
        let mut sum: u32 = 0;
        for chunk in packet.chunks(2) {
            let word = if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                (chunk[0] as u16) << 8
            };
            sum += word as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum, 0xFFFF);
    }

    #[test]
    fn test_build_echo_request_ipv6() {
        let packet = build_echo_request(1234, 5678, DEFAULT_PAYLOAD_SIZE, true);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + DEFAULT_PAYLOAD_SIZE);
        assert_eq!(packet[0], 128); // ICMPv6 Echo Request type
        assert_eq!(packet[1], 0);
    }

    #[test]
    fn test_build_echo_request_exact_sizes() {
        for size in [0, 1, 3, 4, 5, 1400, 1472] {
            let packet = build_echo_request(1, 2, size, false);
            assert_eq!(packet.len(), ICMP_HEADER_SIZE + size);
        }
    }

    /// Answers every IPv4 request with Destination Unreachable `code`
    struct Unreachable {
        code: u8,
        reply: parking_lot::Mutex<Option<Vec<u8>>>,
    }

    impl Unreachable {
        fn new(code: u8) -> Self {
            Self {
                code,
                reply: parking_lot::Mutex::new(None),
            }
        }
    }

    impl IcmpChannel for Unreachable {
        fn send(&self, packet: &[u8], target: IpAddr, _df: bool) -> std::io::Result<usize> {
            let IpAddr::V4(dest) = target else {
                return Ok(packet.len());
            };
            let mut reply = vec![0u8; 20];
            reply[0] = 0x45;
            reply[9] = 1;
            reply.extend_from_slice(&[3, self.code, 0, 0, 0, 0, 0x05, 0x78]);
            let mut quoted = vec![0u8; 20];
            quoted[0] = 0x45;
            quoted[9] = 1;
            quoted[16..20].copy_from_slice(&dest.octets());
            reply.extend_from_slice(&quoted);
            reply.extend_from_slice(&packet[..8]);
            *self.reply.lock() = Some(reply);
            Ok(packet.len())
        }

        fn recv(&self, _ipv6: bool, buf: &mut [u8], _timeout: Duration) -> std::io::Result<(usize, IpAddr)> {
            match self.reply.lock().take() {
                Some(reply) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok((reply.len(), "192.168.1.1".parse().unwrap()))
                }
                None => Err(std::io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_unreachable_codes_are_told_apart() {
        let target: IpAddr = "10.96.0.1".parse().unwrap();

        let host = IcmpProber::with_channel(Unreachable::new(1), Duration::from_secs(1));
        let result = host.probe(target, 64, true);
        assert!(matches!(result, ProbeResult::Failure(ProbeError::Unreachable { code: 1 })));

        let frag = IcmpProber::with_channel(Unreachable::new(4), Duration::from_secs(1));
        let result = frag.probe(target, 1472, true);
        assert_eq!(result.next_hop_mtu(), Some(1400));
    }

    #[test]
    fn test_build_echo_request_embeds_marker() {
        let packet = build_echo_request(0x0102, 0x0304, 16, false);
        assert_eq!(&packet[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(packet[12], 0);
        assert_eq!(packet[13], 1);
    }
}
