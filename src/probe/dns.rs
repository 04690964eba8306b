//! A-record lookups sent straight to an explicit DNS server.
//!
//! The system resolver is never consulted: the point is to test the cluster
//! DNS service itself, so the query goes to exactly the address we are given.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::error::ProbeError;

pub const DNS_PORT: u16 = 53;
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Large enough for any UDP answer a server sends without EDNS
const UDP_BUFFER_SIZE: usize = 4096;

/// Addresses returned for one query. Order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsRecordSet {
    pub name: String,
    pub addresses: Vec<Ipv4Addr>,
}

impl DnsRecordSet {
    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.addresses.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Resolver bound to one DNS server
#[derive(Debug, Clone, Copy)]
pub struct DnsResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    /// Resolver for a server listening on the standard port
    pub fn for_server_ip(server: IpAddr, timeout: Duration) -> Self {
        Self::new(SocketAddr::new(server, DNS_PORT), timeout)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Look up the A records for `fqdn`.
    ///
    /// The whole exchange, including a TCP retry after a truncated UDP answer,
    /// is bounded by the resolver timeout.
    pub async fn lookup_a(&self, fqdn: &str) -> Result<DnsRecordSet, ProbeError> {
        let mut name = Name::from_ascii(fqdn)
            .map_err(|e| ProbeError::InvalidArgument(format!("invalid DNS name {:?}: {}", fqdn, e)))?;
        // No search list: the name is always absolute
        name.set_fqdn(true);
        let id: u16 = rand::random();
        let request = build_query(id, name.clone())
            .to_bytes()
            .map_err(|e| ProbeError::InvalidArgument(format!("cannot encode query for {}: {}", fqdn, e)))?;

        debug!(server = %self.server, %name, id, "sending DNS query");

        let response = tokio::time::timeout(self.timeout, self.exchange(&request, id, &name))
            .await
            .map_err(|_| ProbeError::Timeout)??;

        records_from_response(fqdn, &response)
    }

    async fn exchange(&self, request: &[u8], id: u16, name: &Name) -> Result<Message, ProbeError> {
        let response = self.exchange_udp(request, id, name).await?;
        if response.truncated() {
            debug!(server = %self.server, "UDP answer truncated, retrying over TCP");
            return self.exchange_tcp(request, id, name).await;
        }
        Ok(response)
    }

    async fn exchange_udp(&self, request: &[u8], id: u16, name: &Name) -> Result<Message, ProbeError> {
        let bind: SocketAddr = if self.server.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;
        socket.send(request).await?;

        let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let len = socket.recv(&mut buffer).await?;
            let datagram = &buffer[..len];

            // Only a datagram carrying our id can be a broken answer to us
            let carries_our_id = len >= 2 && u16::from_be_bytes([datagram[0], datagram[1]]) == id;
            let message = match Message::from_vec(datagram) {
                Ok(message) => message,
                Err(e) if carries_our_id => {
                    return Err(ProbeError::MalformedResponse(format!("undecodable DNS answer: {}", e)));
                }
                Err(_) => continue,
            };

            if answers_query(&message, id, name) {
                return Ok(message);
            }
            trace!(got_id = message.id(), "ignoring unrelated DNS datagram");
        }
    }

    async fn exchange_tcp(&self, request: &[u8], id: u16, name: &Name) -> Result<Message, ProbeError> {
        let length = u16::try_from(request.len())
            .map_err(|_| ProbeError::InvalidArgument("DNS query too large for TCP".to_string()))?;

        let mut stream = TcpStream::connect(self.server).await?;
        let mut framed = Vec::with_capacity(request.len() + 2);
        framed.extend_from_slice(&length.to_be_bytes());
        framed.extend_from_slice(request);
        stream.write_all(&framed).await?;

        let length = stream.read_u16().await?;
        let mut buffer = vec![0u8; length as usize];
        stream.read_exact(&mut buffer).await?;

        let message = Message::from_vec(&buffer)
            .map_err(|e| ProbeError::MalformedResponse(format!("undecodable DNS answer: {}", e)))?;
        if !answers_query(&message, id, name) {
            return Err(ProbeError::MalformedResponse(
                "TCP answer does not match the query".to_string(),
            ));
        }
        Ok(message)
    }
}

/// One-shot lookup against `server`
pub async fn resolve(
    server: SocketAddr,
    fqdn: &str,
    timeout: Duration,
) -> Result<DnsRecordSet, ProbeError> {
    DnsResolver::new(server, timeout).lookup_a(fqdn).await
}

fn build_query(id: u16, name: Name) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    message
}

fn answers_query(message: &Message, id: u16, name: &Name) -> bool {
    message.id() == id
        && message.message_type() == MessageType::Response
        && message
            .queries()
            .iter()
            .any(|q| q.name() == name && q.query_type() == RecordType::A)
}

/// Interpret a matched answer.
///
/// NXDOMAIN is `NameNotFound`; a NOERROR answer with no A records is
/// `NoResolution`; any other response code is reported as a bad answer.
fn records_from_response(fqdn: &str, response: &Message) -> Result<DnsRecordSet, ProbeError> {
    match response.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => {
            return Err(ProbeError::NameNotFound {
                name: fqdn.to_string(),
                rcode: ResponseCode::NXDomain.to_string(),
            });
        }
        code => {
            return Err(ProbeError::MalformedResponse(format!(
                "server answered {} for {}",
                code, fqdn
            )));
        }
    }

    let addresses: Vec<Ipv4Addr> = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect();

    if addresses.is_empty() {
        return Err(ProbeError::NoResolution {
            name: fqdn.to_string(),
        });
    }

    debug!(name = fqdn, ?addresses, "DNS answer");
    Ok(DnsRecordSet {
        name: fqdn.to_string(),
        addresses,
    })
}
