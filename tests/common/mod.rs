//! Mock network peers shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::BinEncodable;
use k8snetlook::probe::IcmpChannel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

// ---------------------------------------------------------------------------
// ICMP
// ---------------------------------------------------------------------------

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);

fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
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
    !(sum as u16)
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let total = (20 + payload_len) as u16;
    let mut header = vec![0x45, 0, 0, 0, 0, 0, 0x40, 0, 64, 1, 0, 0];
    header[2..4].copy_from_slice(&total.to_be_bytes());
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());
    let sum = checksum(&header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());
    header
}

/// Echo Reply from `target` for the given request, as a raw socket sees it
pub fn echo_reply(request: &[u8], target: Ipv4Addr) -> Vec<u8> {
    let mut icmp = request.to_vec();
    icmp[0] = 0;
    icmp[2] = 0;
    icmp[3] = 0;
    let sum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut packet = ipv4_header(target, LOCAL, icmp.len());
    packet.extend_from_slice(&icmp);
    packet
}

/// Fragmentation Needed from `router` quoting the request sent to `target`
pub fn frag_needed(request: &[u8], target: Ipv4Addr, router: Ipv4Addr, next_hop_mtu: u16) -> Vec<u8> {
    let mut icmp = vec![3, 4, 0, 0, 0, 0];
    icmp.extend_from_slice(&next_hop_mtu.to_be_bytes());
    icmp.extend_from_slice(&ipv4_header(LOCAL, target, request.len()));
    icmp.extend_from_slice(&request[..8]);
    let sum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut packet = ipv4_header(router, LOCAL, icmp.len());
    packet.extend_from_slice(&icmp);
    packet
}

/// In-memory IPv4 path: payloads up to `max_payload` reach `target` and are
/// answered; larger DF packets get Frag Needed from `ROUTER`.
/// `max_payload: None` is a black hole.
pub struct SimulatedPath {
    pub target: Ipv4Addr,
    pub max_payload: Option<usize>,
    pub report_mtu: bool,
    queue: Mutex<VecDeque<(Vec<u8>, IpAddr)>>,
    sent: Mutex<Vec<(usize, bool)>>,
}

impl SimulatedPath {
    pub fn new(target: Ipv4Addr, max_payload: Option<usize>) -> Self {
        Self {
            target,
            max_payload,
            report_mtu: false,
            queue: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Queue a packet that arrives before any answer
    pub fn inject(&self, packet: Vec<u8>, source: IpAddr) {
        self.queue.lock().unwrap().push_back((packet, source));
    }

    /// (payload size, DF) of every request sent so far
    pub fn sent(&self) -> Vec<(usize, bool)> {
        self.sent.lock().unwrap().clone()
    }
}

impl IcmpChannel for SimulatedPath {
    fn send(&self, packet: &[u8], target: IpAddr, dont_fragment: bool) -> io::Result<usize> {
        let payload = packet.len() - 8;
        self.sent.lock().unwrap().push((payload, dont_fragment));

        if target != IpAddr::V4(self.target) {
            return Ok(packet.len());
        }
        let Some(max) = self.max_payload else {
            return Ok(packet.len());
        };

        let answer = if payload <= max || !dont_fragment {
            (echo_reply(packet, self.target), IpAddr::V4(self.target))
        } else {
            let mtu = if self.report_mtu { (max + 28) as u16 } else { 0 };
            (frag_needed(packet, self.target, ROUTER, mtu), IpAddr::V4(ROUTER))
        };
        self.queue.lock().unwrap().push_back(answer);
        Ok(packet.len())
    }

    fn recv(&self, _ipv6: bool, buf: &mut [u8], timeout: Duration) -> io::Result<(usize, IpAddr)> {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some((packet, source)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok((len, source))
            }
            None => {
                std::thread::sleep(timeout);
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    Normal,
    /// UDP answers carry TC and no records; TCP answers are complete
    TruncateUdp,
    /// Never answer
    Silent,
}

fn dns_answer(query: &Message, zone: &[(Name, Vec<Ipv4Addr>)], truncate: bool) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .add_queries(query.queries().to_vec());

    let Some(question) = query.queries().first() else {
        response.set_response_code(ResponseCode::FormErr);
        return response;
    };

    match zone.iter().find(|(name, _)| name == question.name()) {
        None => {
            response.set_response_code(ResponseCode::NXDomain);
        }
        Some(_) if truncate => {
            response.set_truncated(true);
        }
        Some((name, addresses)) => {
            for addr in addresses {
                response.add_answer(Record::from_rdata(name.clone(), 30, RData::A(A(*addr))));
            }
        }
    }
    response
}

/// Start an authoritative mock server on 127.0.0.1 (UDP and TCP, same port).
///
/// Names in `zone` with an empty list answer NOERROR with no records; any
/// other name is NXDOMAIN.
pub async fn spawn_dns_server(zone: Vec<(&str, Vec<Ipv4Addr>)>, mode: DnsMode) -> SocketAddr {
    let zone: Arc<Vec<(Name, Vec<Ipv4Addr>)>> = Arc::new(
        zone.into_iter()
            .map(|(name, addrs)| (Name::from_ascii(name).unwrap(), addrs))
            .collect(),
    );

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = udp.local_addr().unwrap();
    let tcp = TcpListener::bind(addr).await.unwrap();

    let udp_zone = Arc::clone(&zone);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                return;
            };
            if mode == DnsMode::Silent {
                continue;
            }
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            let response = dns_answer(&query, &udp_zone, mode == DnsMode::TruncateUdp);
            let _ = udp.send_to(&response.to_bytes().unwrap(), peer).await;
        }
    });

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = tcp.accept().await else {
                return;
            };
            let zone = Arc::clone(&zone);
            tokio::spawn(async move {
                let Ok(len) = stream.read_u16().await else {
                    return;
                };
                let mut buf = vec![0u8; len as usize];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let Ok(query) = Message::from_vec(&buf) else {
                    return;
                };
                let bytes = dns_answer(&query, &zone, false).to_bytes().unwrap();
                let mut framed = (bytes.len() as u16).to_be_bytes().to_vec();
                framed.extend_from_slice(&bytes);
                let _ = stream.write_all(&framed).await;
            });
        }
    });

    addr
}

// ---------------------------------------------------------------------------
// HTTPS
// ---------------------------------------------------------------------------

/// What a mock HTTPS server answers with
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.as_bytes().to_vec(),
        }
    }
}

/// Requests seen by a mock server: (request line, Authorization header)
pub type SeenRequests = Arc<Mutex<Vec<(String, Option<String>)>>>;

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Start an HTTPS server on 127.0.0.1 with a fresh self-signed certificate
/// that no client would trust.
pub async fn spawn_https_server(reply: HttpReply) -> (SocketAddr, SeenRequests) {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["apiserver.invalid".to_string()]).unwrap();
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: SeenRequests = Arc::new(Mutex::new(Vec::new()));

    let seen_by_server = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let reply = reply.clone();
            let seen = Arc::clone(&seen_by_server);
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };

                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }

                let text = String::from_utf8_lossy(&request).into_owned();
                let mut lines = text.split("\r\n");
                let request_line = lines.next().unwrap_or_default().to_string();
                let authorization = lines.find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("authorization")
                        .then(|| value.trim().to_string())
                });
                seen.lock().unwrap().push((request_line, authorization));

                let head = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n",
                    reply.status,
                    reason(reply.status),
                    reply.body.len()
                );
                let _ = tls.write_all(head.as_bytes()).await;
                let _ = tls.write_all(&reply.body).await;
                let _ = tls.shutdown().await;
            });
        }
    });

    (addr, seen)
}
