use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use std::net::{IpAddr, Ipv6Addr};

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

// ICMPv4 Destination Unreachable code for "fragmentation needed and DF set"
pub const ICMP_CODE_FRAG_NEEDED: u8 = 4;

// ICMPv6 type codes
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_PACKET_TOO_BIG: u8 = 2;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

const IPV6_HEADER_LEN: usize = 40;

/// ICMP message kinds the prober distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpResponseType {
    EchoReply,
    /// Destination Unreachable with its code (4 = fragmentation needed on IPv4)
    DestUnreachable(u8),
    /// ICMPv6 Packet Too Big
    PacketTooBig,
    TimeExceeded(u8),
}

impl IcmpResponseType {
    /// True for IPv4 Frag Needed and ICMPv6 Packet Too Big
    pub fn is_frag_needed(&self) -> bool {
        matches!(
            self,
            IcmpResponseType::DestUnreachable(ICMP_CODE_FRAG_NEEDED)
                | IcmpResponseType::PacketTooBig
        )
    }
}

/// Parsed ICMP response that belongs to one of our echo requests
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub responder: IpAddr,
    pub identifier: u16,
    pub sequence: u16,
    pub response_type: IcmpResponseType,
    /// Next-hop MTU from Frag Needed (bytes 6-7) or Packet Too Big (bytes 4-7)
    pub mtu: Option<u16>,
    /// Destination of the quoted request (equals responder for Echo Reply)
    pub original_dest: Option<IpAddr>,
}

/// Validate an ICMP checksum (RFC 1071).
/// Valid data folds to 0xFFFF (or 0x0000 for an all-zero message).
fn validate_icmp_checksum(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum == 0xFFFF || sum == 0x0000
}

/// Parse an ICMP/ICMPv6 packet read from a raw socket and keep it only if it
/// answers an echo request carrying `our_identifier`.
///
/// Raw IPv4 sockets deliver the IP header; raw ICMPv6 sockets on Linux deliver
/// the ICMPv6 message directly, so the responder's family selects the parser.
///
/// Returns None for unrelated traffic, foreign identifiers, bad checksums and
/// truncated packets.
pub fn parse_icmp_response(
    data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
) -> Option<ParsedResponse> {
    if data.is_empty() {
        return None;
    }

    match responder {
        IpAddr::V4(_) => parse_icmp_response_v4(data, responder, our_identifier),
        IpAddr::V6(_) => parse_icmp_response_v6(data, responder, our_identifier),
    }
}

fn parse_icmp_response_v4(
    data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
) -> Option<ParsedResponse> {
    let ip_packet = Ipv4Packet::new(data)?;
    if ip_packet.get_version() != 4 {
        return None;
    }
    let ip_header_len = (ip_packet.get_header_length() as usize) * 4;

    if data.len() < ip_header_len + 8 {
        return None;
    }

    let icmp_data = &data[ip_header_len..];
    let icmp_packet = IcmpPacket::new(icmp_data)?;
    let code = icmp_packet.get_icmp_code().0;

    match icmp_packet.get_icmp_type() {
        IcmpTypes::EchoReply => {
            if !validate_icmp_checksum(icmp_data) {
                return None;
            }

            let identifier = u16::from_be_bytes([icmp_data[4], icmp_data[5]]);
            let sequence = u16::from_be_bytes([icmp_data[6], icmp_data[7]]);
            if identifier != our_identifier {
                return None;
            }

            Some(ParsedResponse {
                responder,
                identifier,
                sequence,
                response_type: IcmpResponseType::EchoReply,
                mtu: None,
                original_dest: Some(responder),
            })
        }
        IcmpTypes::DestinationUnreachable => {
            // Frag Needed carries the next-hop MTU in bytes 6-7 (RFC 1191)
            let mtu = if code == ICMP_CODE_FRAG_NEEDED {
                let mtu_val = u16::from_be_bytes([icmp_data[6], icmp_data[7]]);
                if mtu_val > 0 { Some(mtu_val) } else { None }
            } else {
                None
            };
            parse_icmp_error_payload_v4(
                icmp_data,
                responder,
                our_identifier,
                IcmpResponseType::DestUnreachable(code),
                mtu,
            )
        }
        IcmpTypes::TimeExceeded => parse_icmp_error_payload_v4(
            icmp_data,
            responder,
            our_identifier,
            IcmpResponseType::TimeExceeded(code),
            None,
        ),
        _ => None,
    }
}

/// Match the echo request quoted inside an IPv4 ICMP error.
fn parse_icmp_error_payload_v4(
    icmp_data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
    response_type: IcmpResponseType,
    mtu: Option<u16>,
) -> Option<ParsedResponse> {
    // [0-7] ICMP error header, [8..] original IP header + at least 8 bytes of its payload
    if icmp_data.len() < 8 + 20 + 8 {
        return None;
    }

    let original_ip_data = &icmp_data[8..];
    let original_ip = Ipv4Packet::new(original_ip_data)?;
    let orig_ihl = (original_ip.get_header_length() as usize) * 4;
    if original_ip.get_next_level_protocol().0 != IPPROTO_ICMP {
        return None;
    }
    if original_ip_data.len() < orig_ihl + 8 {
        return None;
    }

    let original_payload = &original_ip_data[orig_ihl..];
    if original_payload[0] != IcmpTypes::EchoRequest.0 {
        return None;
    }

    let identifier = u16::from_be_bytes([original_payload[4], original_payload[5]]);
    let sequence = u16::from_be_bytes([original_payload[6], original_payload[7]]);
    if identifier != our_identifier {
        return None;
    }

    Some(ParsedResponse {
        responder,
        identifier,
        sequence,
        response_type,
        mtu,
        original_dest: Some(IpAddr::V4(original_ip.get_destination())),
    })
}

/// Parse an ICMPv6 message (no IPv6 header, the kernel strips it).
///
/// ICMPv6 checksums need the pseudo-header, which is not available here;
/// the kernel has already validated them before delivery.
fn parse_icmp_response_v6(
    icmp_data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
) -> Option<ParsedResponse> {
    if icmp_data.len() < 8 {
        return None;
    }

    let icmp_type = icmp_data[0];
    let icmp_code = icmp_data[1];

    match icmp_type {
        ICMPV6_ECHO_REPLY => {
            let identifier = u16::from_be_bytes([icmp_data[4], icmp_data[5]]);
            let sequence = u16::from_be_bytes([icmp_data[6], icmp_data[7]]);
            if identifier != our_identifier {
                return None;
            }
            Some(ParsedResponse {
                responder,
                identifier,
                sequence,
                response_type: IcmpResponseType::EchoReply,
                mtu: None,
                original_dest: Some(responder),
            })
        }
        ICMPV6_PACKET_TOO_BIG => {
            let mtu_val =
                u32::from_be_bytes([icmp_data[4], icmp_data[5], icmp_data[6], icmp_data[7]]);
            let mtu = if mtu_val > 0 && mtu_val <= u16::MAX as u32 {
                Some(mtu_val as u16)
            } else {
                None
            };
            parse_icmp_error_payload_v6(
                icmp_data,
                responder,
                our_identifier,
                IcmpResponseType::PacketTooBig,
                mtu,
            )
        }
        ICMPV6_TIME_EXCEEDED => parse_icmp_error_payload_v6(
            icmp_data,
            responder,
            our_identifier,
            IcmpResponseType::TimeExceeded(icmp_code),
            None,
        ),
        ICMPV6_DEST_UNREACHABLE => parse_icmp_error_payload_v6(
            icmp_data,
            responder,
            our_identifier,
            IcmpResponseType::DestUnreachable(icmp_code),
            None,
        ),
        _ => None,
    }
}

/// Match the echo request quoted inside an ICMPv6 error.
///
/// Assumes the quoted IPv6 packet has no extension headers, which holds for
/// the plain echo requests we send.
fn parse_icmp_error_payload_v6(
    icmp_data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
    response_type: IcmpResponseType,
    mtu: Option<u16>,
) -> Option<ParsedResponse> {
    if icmp_data.len() < 8 + IPV6_HEADER_LEN + 8 {
        return None;
    }

    let original_ipv6 = &icmp_data[8..];
    if original_ipv6[6] != IPPROTO_ICMPV6 {
        return None;
    }

    let mut dest = [0u8; 16];
    dest.copy_from_slice(&original_ipv6[24..40]);
    let original_dest = Some(IpAddr::V6(Ipv6Addr::from(dest)));

    let original_payload = &original_ipv6[IPV6_HEADER_LEN..];
    if original_payload[0] != ICMPV6_ECHO_REQUEST {
        return None;
    }

    let identifier = u16::from_be_bytes([original_payload[4], original_payload[5]]);
    let sequence = u16::from_be_bytes([original_payload[6], original_payload[7]]);
    if identifier != our_identifier {
        return None;
    }

    Some(ParsedResponse {
        responder,
        identifier,
        sequence,
        response_type,
        mtu,
        original_dest,
    })
}
