/**
 * nat_traversal/stun.rs
 *
 * STUN client for NAT discovery: binding requests with retry/backoff,
 * CHANGE-REQUEST behaviour tests, and the message codec shared with TURN.
 */

use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::nat_traversal::types::TransportAddress;

/// STUN magic cookie
pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

/// STUN / TURN methods
pub const METHOD_BINDING: u16 = 0x0001;
pub const METHOD_ALLOCATE: u16 = 0x0003;
pub const METHOD_REFRESH: u16 = 0x0004;
pub const METHOD_SEND: u16 = 0x0006;
pub const METHOD_DATA: u16 = 0x0007;
pub const METHOD_CREATE_PERMISSION: u16 = 0x0008;

/// STUN attribute types
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_CHANGE_REQUEST: u16 = 0x0003;
pub const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_LIFETIME: u16 = 0x000D;
pub const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
pub const ATTR_DATA: u16 = 0x0013;
pub const ATTR_REALM: u16 = 0x0014;
pub const ATTR_NONCE: u16 = 0x0015;
pub const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_SOFTWARE: u16 = 0x8022;
pub const ATTR_RESPONSE_ORIGIN: u16 = 0x802B;
pub const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

/// STUN probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no STUN response from {server} after {attempts} attempts")]
    Timeout { server: SocketAddr, attempts: u32 },

    #[error("malformed STUN message: {0}")]
    Malformed(String),

    #[error("STUN error response {code}: {reason}")]
    ErrorResponse { code: u16, reason: String },

    #[error("STUN socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    Request,
    Indication,
    Success,
    Error,
}

/// Raw type-length-value attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    pub kind: u16,
    pub value: Vec<u8>,
}

/// A STUN (or TURN) message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub method: u16,
    pub class: StunClass,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    pub fn new(method: u16, class: StunClass, transaction_id: [u8; 12]) -> Self {
        Self {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Binding request, optionally asking the server to answer from its
    /// alternate IP and/or port
    pub fn binding_request(transaction_id: [u8; 12], change_ip: bool, change_port: bool) -> Self {
        let mut msg = Self::new(METHOD_BINDING, StunClass::Request, transaction_id);

        if change_ip || change_port {
            let mut flags = 0u32;
            if change_ip {
                flags |= CHANGE_IP_FLAG;
            }
            if change_port {
                flags |= CHANGE_PORT_FLAG;
            }
            msg.push(ATTR_CHANGE_REQUEST, flags.to_be_bytes().to_vec());
        }

        msg
    }

    /// Binding success response carrying XOR-MAPPED-ADDRESS (server side)
    pub fn binding_success(transaction_id: [u8; 12], mapped: SocketAddr) -> Self {
        let mut msg = Self::new(METHOD_BINDING, StunClass::Success, transaction_id);
        msg.push_xor_address(ATTR_XOR_MAPPED_ADDRESS, mapped);
        msg
    }

    pub fn push(&mut self, kind: u16, value: Vec<u8>) {
        self.attributes.push(StunAttribute { kind, value });
    }

    pub fn push_xor_address(&mut self, kind: u16, addr: SocketAddr) {
        let value = encode_address(addr, Some(&self.transaction_id));
        self.push(kind, value);
    }

    pub fn push_address(&mut self, kind: u16, addr: SocketAddr) {
        self.push(kind, encode_address(addr, None));
    }

    /// First attribute of a type
    pub fn attribute(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_slice())
    }

    pub fn xor_address(&self, kind: u16) -> Option<SocketAddr> {
        self.attribute(kind)
            .and_then(|v| decode_address(v, Some(&self.transaction_id)))
    }

    pub fn address(&self, kind: u16) -> Option<SocketAddr> {
        self.attribute(kind).and_then(|v| decode_address(v, None))
    }

    /// Mapped address, preferring XOR-MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.xor_address(ATTR_XOR_MAPPED_ADDRESS)
            .or_else(|| self.address(ATTR_MAPPED_ADDRESS))
    }

    /// ERROR-CODE as (code, reason)
    pub fn error_code(&self) -> Option<(u16, String)> {
        let v = self.attribute(ATTR_ERROR_CODE)?;
        if v.len() < 4 {
            return None;
        }
        let code = u16::from(v[2] & 0x07) * 100 + u16::from(v[3]);
        let reason = String::from_utf8_lossy(&v[4..]).to_string();
        Some((code, reason))
    }

    pub fn text(&self, kind: u16) -> Option<String> {
        self.attribute(kind)
            .map(|v| String::from_utf8_lossy(v).trim_end_matches('\0').to_string())
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + 64);

        // Message type (16 bits)
        bytes.extend_from_slice(&message_type(self.method, self.class).to_be_bytes());

        // Message length (16 bits), patched below
        bytes.extend_from_slice(&0u16.to_be_bytes());

        // Magic cookie (32 bits)
        bytes.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());

        // Transaction ID (96 bits)
        bytes.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            bytes.extend_from_slice(&attr.kind.to_be_bytes());
            bytes.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            bytes.extend_from_slice(&attr.value);

            // Attributes are padded to 4-byte boundaries
            let padding = (4 - attr.value.len() % 4) % 4;
            bytes.extend(std::iter::repeat(0u8).take(padding));
        }

        let len = (bytes.len() - HEADER_LEN) as u16;
        bytes[2..4].copy_from_slice(&len.to_be_bytes());
        bytes
    }

    /// Serialize and append MESSAGE-INTEGRITY (HMAC-SHA1 over everything
    /// before it, with the length field already counting the attribute)
    pub fn encode_with_integrity(&self, key: &[u8]) -> Vec<u8> {
        let mut bytes = self.encode();

        let len = (bytes.len() - HEADER_LEN + 24) as u16;
        bytes[2..4].copy_from_slice(&len.to_be_bytes());

        // HMAC-SHA1 accepts keys of any length
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(&bytes);
        let digest = mac.finalize().into_bytes();

        bytes.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
        bytes.extend_from_slice(&20u16.to_be_bytes());
        bytes.extend_from_slice(&digest);
        bytes
    }

    /// Deserialize from bytes
    pub fn decode(data: &[u8]) -> Result<Self, ProbeError> {
        if data.len() < HEADER_LEN {
            return Err(ProbeError::Malformed("message too short".into()));
        }

        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        if msg_type & 0xC000 != 0 {
            return Err(ProbeError::Malformed("not a STUN message".into()));
        }

        let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if magic != STUN_MAGIC_COOKIE {
            return Err(ProbeError::Malformed("invalid magic cookie".into()));
        }

        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < HEADER_LEN + msg_len {
            return Err(ProbeError::Malformed("message truncated".into()));
        }

        let (method, class) = split_type(msg_type);
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let end = HEADER_LEN + msg_len;
        let mut offset = HEADER_LEN;
        while offset + 4 <= end {
            let kind = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;

            if offset + len > end {
                return Err(ProbeError::Malformed(format!(
                    "attribute 0x{:04x} overruns message",
                    kind
                )));
            }

            attributes.push(StunAttribute {
                kind,
                value: data[offset..offset + len].to_vec(),
            });
            offset += (len + 3) & !3;
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }

    /// Quick check used to tell STUN traffic apart from other datagrams
    /// sharing a socket
    pub fn looks_like_stun(data: &[u8]) -> bool {
        data.len() >= HEADER_LEN
            && data[0] & 0xC0 == 0
            && data[4..8] == STUN_MAGIC_COOKIE.to_be_bytes()
    }
}

/// Interleave method and class bits (RFC 5389 section 6)
fn message_type(method: u16, class: StunClass) -> u16 {
    let class_bits: u16 = match class {
        StunClass::Request => 0b00,
        StunClass::Indication => 0b01,
        StunClass::Success => 0b10,
        StunClass::Error => 0b11,
    };

    (method & 0x000F)
        | ((class_bits & 0x01) << 4)
        | ((method & 0x0070) << 1)
        | ((class_bits & 0x02) << 7)
        | ((method & 0x0F80) << 2)
}

fn split_type(msg_type: u16) -> (u16, StunClass) {
    let method = (msg_type & 0x000F) | ((msg_type >> 1) & 0x0070) | ((msg_type >> 2) & 0x0F80);
    let class = match ((msg_type >> 4) & 0x01) | ((msg_type >> 7) & 0x02) {
        0b00 => StunClass::Request,
        0b01 => StunClass::Indication,
        0b10 => StunClass::Success,
        _ => StunClass::Error,
    };
    (method, class)
}

/// Encode a (XOR-)MAPPED-ADDRESS style value
fn encode_address(addr: SocketAddr, transaction_id: Option<&[u8; 12]>) -> Vec<u8> {
    let mut value = vec![0u8];
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();

    let port = match transaction_id {
        Some(_) => addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if transaction_id.is_some() {
                for (o, k) in octets.iter_mut().zip(cookie.iter()) {
                    *o ^= k;
                }
            }
            value.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if let Some(tid) = transaction_id {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&cookie);
                key[4..].copy_from_slice(tid);
                for (o, k) in octets.iter_mut().zip(key.iter()) {
                    *o ^= k;
                }
            }
            value.extend_from_slice(&octets);
        }
    }

    value
}

/// Decode a (XOR-)MAPPED-ADDRESS style value
fn decode_address(data: &[u8], transaction_id: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if transaction_id.is_some() {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();

    let ip = match family {
        0x01 => {
            let mut octets = [data[4], data[5], data[6], data[7]];
            if transaction_id.is_some() {
                for (o, k) in octets.iter_mut().zip(cookie.iter()) {
                    *o ^= k;
                }
            }
            IpAddr::from(octets)
        }
        0x02 => {
            if data.len() < 20 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            if let Some(tid) = transaction_id {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&cookie);
                key[4..].copy_from_slice(tid);
                for (o, k) in octets.iter_mut().zip(key.iter()) {
                    *o ^= k;
                }
            }
            IpAddr::from(octets)
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Retry policy for binding requests
#[derive(Debug, Clone)]
pub struct StunConfig {
    pub attempts: u32,
    /// First receive timeout, doubled after every attempt
    pub initial_timeout: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_timeout: Duration::from_millis(500),
        }
    }
}

/// Whether the server answered a CHANGE-REQUEST from where we asked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeRequestStatus {
    NotRequested,
    Honored,
    /// The server replied from its original address
    Ignored,
}

/// STUN query response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunResponse {
    pub mapped: TransportAddress,
    /// Source address the response came from
    pub responder: SocketAddr,
    /// OTHER-ADDRESS (or legacy CHANGED-ADDRESS); present when the server
    /// supports behaviour discovery
    pub other_address: Option<SocketAddr>,
    pub server_software: Option<String>,
    pub change: ChangeRequestStatus,
}

/// One step of a discovery run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub server: SocketAddr,
    pub change_ip: bool,
    pub change_port: bool,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Mapped(StunResponse),
    NoResponse,
    /// The server rejected or cannot serve the request kind
    Unsupported,
    Failed(String),
}

impl ProbeResult {
    pub fn response(&self) -> Option<&StunResponse> {
        match &self.outcome {
            ProbeOutcome::Mapped(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_plain(&self) -> bool {
        !self.change_ip && !self.change_port
    }
}

/// STUN client
pub struct StunClient {
    socket: UdpSocket,
    config: StunConfig,
}

impl StunClient {
    /// Create a STUN client over an already bound socket
    pub fn new(socket: UdpSocket, config: StunConfig) -> Self {
        Self { socket, config }
    }

    pub async fn bind(addr: SocketAddr, config: StunConfig) -> Result<Self, ProbeError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(socket, config))
    }

    /// Probe a server and return the reflexive address
    pub async fn probe(
        &self,
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> Result<TransportAddress, ProbeError> {
        self.probe_detailed(server, change_ip, change_port)
            .await
            .map(|r| r.mapped)
    }

    /// Probe a server, retrying with exponential backoff
    pub async fn probe_detailed(
        &self,
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> Result<StunResponse, ProbeError> {
        let transaction_id: [u8; 12] = rand::random();
        let request = StunMessage::binding_request(transaction_id, change_ip, change_port).encode();

        let mut timeout = self.config.initial_timeout;
        let mut buffer = vec![0u8; 1024];

        for attempt in 1..=self.config.attempts {
            self.socket.send_to(&request, server).await?;
            trace!(%server, attempt, change_ip, change_port, "sent STUN binding request");

            let deadline = Instant::now() + timeout;
            loop {
                let received =
                    tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buffer)).await;

                let (len, from) = match received {
                    Err(_) => break,
                    Ok(Ok(r)) => r,
                    // ICMP errors surface here on some platforms
                    Ok(Err(e)) if matches!(e.kind(), std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused) => continue,
                    Ok(Err(e)) => return Err(e.into()),
                };

                match StunMessage::decode(&buffer[..len]) {
                    Ok(msg) if msg.transaction_id == transaction_id => {
                        return Self::interpret(msg, server, from, change_ip, change_port);
                    }
                    Ok(_) => trace!(%from, "ignoring STUN message for another transaction"),
                    Err(e) => trace!(%from, error = %e, "ignoring non-STUN datagram"),
                }
            }

            debug!(%server, attempt, timeout_ms = timeout.as_millis() as u64, "STUN probe timed out");
            timeout *= 2;
        }

        Err(ProbeError::Timeout {
            server,
            attempts: self.config.attempts,
        })
    }

    fn interpret(
        msg: StunMessage,
        server: SocketAddr,
        from: SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> Result<StunResponse, ProbeError> {
        match msg.class {
            StunClass::Success => {}
            StunClass::Error => {
                let (code, reason) = msg.error_code().unwrap_or((0, "unspecified".into()));
                return Err(ProbeError::ErrorResponse { code, reason });
            }
            other => {
                return Err(ProbeError::Malformed(format!(
                    "unexpected message class {:?}",
                    other
                )))
            }
        }

        let mapped = msg
            .mapped_address()
            .ok_or_else(|| ProbeError::Malformed("no address attribute in response".into()))?;

        let change = if !change_ip && !change_port {
            ChangeRequestStatus::NotRequested
        } else {
            let ip_ok = !change_ip || from.ip() != server.ip();
            let port_ok = !change_port || from.port() != server.port();
            if ip_ok && port_ok {
                ChangeRequestStatus::Honored
            } else {
                ChangeRequestStatus::Ignored
            }
        };

        Ok(StunResponse {
            mapped: TransportAddress::udp(mapped),
            responder: from,
            other_address: msg
                .address(ATTR_OTHER_ADDRESS)
                .or_else(|| msg.address(ATTR_CHANGED_ADDRESS)),
            server_software: msg.text(ATTR_SOFTWARE),
            change,
        })
    }

    async fn step(&self, server: SocketAddr, change_ip: bool, change_port: bool) -> ProbeResult {
        let outcome = match self.probe_detailed(server, change_ip, change_port).await {
            Ok(r) => ProbeOutcome::Mapped(r),
            Err(ProbeError::Timeout { .. }) => ProbeOutcome::NoResponse,
            Err(ProbeError::ErrorResponse { code: 420, .. }) => ProbeOutcome::Unsupported,
            Err(e) if change_ip || change_port => {
                debug!(%server, error = %e, "behaviour test inconclusive");
                ProbeOutcome::Unsupported
            }
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        };

        ProbeResult {
            server,
            change_ip,
            change_port,
            outcome,
        }
    }

    /// Run the mapping and filtering test sequence from this socket.
    ///
    /// Mapping: a plain probe per server (or to the first server's
    /// alternate address when only one server is configured).
    /// Filtering: change-IP+port, then change-port, against the first
    /// server that advertised an alternate address.
    pub async fn discover(&self, servers: &[SocketAddr]) -> Vec<ProbeResult> {
        let mut results = Vec::new();

        for &server in servers {
            results.push(self.step(server, false, false).await);
        }

        let capable = results
            .iter()
            .find_map(|r| r.response().and_then(|resp| resp.other_address.map(|o| (r.server, o))));

        if let Some((server, other)) = capable {
            if servers.len() < 2 && other.ip() != server.ip() {
                results.push(self.step(other, false, false).await);
            }

            let full = self.step(server, true, true).await;
            let answered = matches!(
                &full.outcome,
                ProbeOutcome::Mapped(r) if r.change == ChangeRequestStatus::Honored
            );
            results.push(full);

            if !answered {
                results.push(self.step(server, false, true).await);
            }
        } else {
            debug!("no server advertised an alternate address; skipping filtering tests");
        }

        results
    }

    /// Get local socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Convert into UDP socket for hole punching
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> StunConfig {
        StunConfig {
            attempts: 2,
            initial_timeout: Duration::from_millis(40),
        }
    }

    #[test]
    fn binding_request_header() {
        let tid = [7u8; 12];
        let bytes = StunMessage::binding_request(tid, false, false).encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 0x00]);
        assert_eq!(&bytes[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&bytes[8..20], &tid);
    }

    #[test]
    fn change_request_flags() {
        let msg = StunMessage::binding_request([1; 12], true, true);
        assert_eq!(msg.attribute(ATTR_CHANGE_REQUEST), Some(&[0, 0, 0, 6][..]));
        let msg = StunMessage::binding_request([1; 12], false, true);
        assert_eq!(msg.attribute(ATTR_CHANGE_REQUEST), Some(&[0, 0, 0, 2][..]));
    }

    #[test]
    fn message_types_match_rfc() {
        assert_eq!(message_type(METHOD_BINDING, StunClass::Success), 0x0101);
        assert_eq!(message_type(METHOD_BINDING, StunClass::Error), 0x0111);
        assert_eq!(message_type(METHOD_ALLOCATE, StunClass::Success), 0x0103);
        assert_eq!(message_type(METHOD_SEND, StunClass::Indication), 0x0016);
        assert_eq!(message_type(METHOD_DATA, StunClass::Indication), 0x0017);
        assert_eq!(split_type(0x0118), (METHOD_CREATE_PERMISSION, StunClass::Error));
    }

    #[test]
    fn xor_mapped_address_v4_and_v6() {
        let tid = [9u8; 12];
        for addr in ["198.51.100.5:50000", "[2001:db8::42]:3478"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let bytes = StunMessage::binding_success(tid, addr).encode();
            let decoded = StunMessage::decode(&bytes).unwrap();
            assert_eq!(decoded.class, StunClass::Success);
            assert_eq!(decoded.mapped_address(), Some(addr));
        }
    }

    #[test]
    fn mapped_address_fallback() {
        let mut msg = StunMessage::new(METHOD_BINDING, StunClass::Success, [3; 12]);
        msg.push_address(ATTR_MAPPED_ADDRESS, "203.0.113.1:40000".parse().unwrap());
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.mapped_address(), Some("203.0.113.1:40000".parse().unwrap()));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(StunMessage::decode(&[0u8; 10]).is_err());
        assert!(StunMessage::decode(&[0u8; 20]).is_err());

        let mut bytes = StunMessage::binding_success([1; 12], "1.2.3.4:5".parse().unwrap()).encode();
        bytes[3] += 8; // claims more attributes than present
        assert!(StunMessage::decode(&bytes).is_err());
    }

    #[test]
    fn integrity_attribute_is_last_and_counted() {
        let msg = StunMessage::binding_request([2; 12], false, false);
        let bytes = msg.encode_with_integrity(b"secret");
        assert_eq!(bytes.len(), 20 + 24);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 24);
        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.attribute(ATTR_MESSAGE_INTEGRITY).map(|v| v.len()), Some(20));
    }

    #[test]
    fn error_code_parsing() {
        let mut msg = StunMessage::new(METHOD_BINDING, StunClass::Error, [0; 12]);
        let mut value = vec![0, 0, 4, 20];
        value.extend_from_slice(b"Unknown Attribute");
        msg.push(ATTR_ERROR_CODE, value);
        assert_eq!(msg.error_code(), Some((420, "Unknown Attribute".to_string())));
    }

    /// Answers binding requests, optionally dropping the first few and
    /// always emitting a stale response first
    async fn fake_server(socket: UdpSocket, drop_first: usize) {
        let mut buf = [0u8; 1024];
        let mut seen = 0;
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(req) = StunMessage::decode(&buf[..len]) else {
                continue;
            };
            seen += 1;
            if seen <= drop_first {
                continue;
            }
            let stale = StunMessage::binding_success([0xEE; 12], "9.9.9.9:9".parse().unwrap());
            let _ = socket.send_to(&stale.encode(), from).await;
            let resp = StunMessage::binding_success(req.transaction_id, from);
            let _ = socket.send_to(&resp.encode(), from).await;
        }
    }

    #[tokio::test]
    async fn probe_returns_reflexive_address() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(fake_server(server, 0));

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap(), quick()).await.unwrap();
        let local = client.local_addr().unwrap();
        let mapped = client.probe(server_addr, false, false).await.unwrap();
        assert_eq!(mapped, TransportAddress::udp(local));
    }

    #[tokio::test]
    async fn probe_retries_after_loss() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(fake_server(server, 1));

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap(), quick()).await.unwrap();
        assert!(client.probe(server_addr, false, false).await.is_ok());
    }

    #[tokio::test]
    async fn probe_times_out_against_silent_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap(), quick()).await.unwrap();
        let err = client.probe(silent_addr, false, false).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { attempts: 2, .. }));
        drop(silent);
    }

    #[tokio::test]
    async fn ignored_change_request_is_reported() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(fake_server(server, 0));

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap(), quick()).await.unwrap();
        let resp = client.probe_detailed(server_addr, true, true).await.unwrap();
        assert_eq!(resp.change, ChangeRequestStatus::Ignored);
        assert_eq!(resp.other_address, None);
    }

    #[tokio::test]
    async fn discover_without_behaviour_support_skips_filtering() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(fake_server(server, 0));

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap(), quick()).await.unwrap();
        let results = client.discover(&[server_addr]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_plain());
        assert!(results[0].response().is_some());
    }
}
