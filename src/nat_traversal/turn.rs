/**
 * nat_traversal/turn.rs
 *
 * TURN client (RFC 5766) for relay fallback when hole punching fails:
 * Allocate with long-term credentials, CreatePermission, Refresh and
 * Send/Data indications.
 */

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::mesh::link::Datagram;
use crate::nat_traversal::stun::{
    ProbeError, StunClass, StunConfig, StunMessage, ATTR_DATA, ATTR_LIFETIME, ATTR_NONCE, ATTR_REALM,
    ATTR_REQUESTED_TRANSPORT, ATTR_USERNAME, ATTR_XOR_MAPPED_ADDRESS, ATTR_XOR_PEER_ADDRESS,
    ATTR_XOR_RELAYED_ADDRESS, METHOD_ALLOCATE, METHOD_CREATE_PERMISSION, METHOD_DATA, METHOD_REFRESH,
    METHOD_SEND,
};

const TRANSPORT_UDP: u8 = 17;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("no response from TURN server {0}")]
    Timeout(SocketAddr),

    #[error("TURN {method} rejected with {code}: {reason}")]
    Rejected {
        method: &'static str,
        code: u16,
        reason: String,
    },

    #[error("TURN server rejected our credentials")]
    Unauthorized,

    #[error("TURN client has no allocation")]
    NotAllocated,

    #[error("malformed TURN response: {0}")]
    Malformed(String),

    #[error("TURN socket error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProbeError> for TurnError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Io(e) => TurnError::Io(e),
            other => TurnError::Malformed(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct TurnConfig {
    pub server: SocketAddr,
    pub username: String,
    pub password: String,
    /// Requested allocation lifetime
    pub lifetime: Duration,
    /// How often the allocation and permission are refreshed
    pub refresh_interval: Duration,
    pub retry: StunConfig,
}

impl TurnConfig {
    pub fn new(server: SocketAddr, username: &str, password: &str) -> Self {
        Self {
            server,
            username: username.to_string(),
            password: password.to_string(),
            lifetime: Duration::from_secs(600),
            refresh_interval: Duration::from_secs(120),
            retry: StunConfig::default(),
        }
    }
}

impl fmt::Debug for TurnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("lifetime", &self.lifetime)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

/// Long-term credential state learned from the server's 401
#[derive(Clone)]
struct Credentials {
    username: String,
    realm: String,
    nonce: String,
    key: Zeroizing<[u8; 16]>,
}

impl Credentials {
    fn new(username: &str, password: &str, realm: String, nonce: String) -> Self {
        let digest = Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes());
        let mut key = Zeroizing::new([0u8; 16]);
        key.copy_from_slice(&digest);
        Self {
            username: username.to_string(),
            realm,
            nonce,
            key,
        }
    }

    /// Attach USERNAME/REALM/NONCE and sign
    fn sign(&self, msg: &mut StunMessage) -> Vec<u8> {
        msg.push(ATTR_USERNAME, self.username.as_bytes().to_vec());
        msg.push(ATTR_REALM, self.realm.as_bytes().to_vec());
        msg.push(ATTR_NONCE, self.nonce.as_bytes().to_vec());
        msg.encode_with_integrity(self.key.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnAllocation {
    pub relayed: SocketAddr,
    pub mapped: Option<SocketAddr>,
    pub lifetime: Duration,
}

fn method_name(method: u16) -> &'static str {
    match method {
        METHOD_ALLOCATE => "Allocate",
        METHOD_REFRESH => "Refresh",
        METHOD_CREATE_PERMISSION => "CreatePermission",
        _ => "request",
    }
}

fn lifetime_of(msg: &StunMessage) -> Option<Duration> {
    let v = msg.attribute(ATTR_LIFETIME)?;
    let secs = u32::from_be_bytes(v.get(..4)?.try_into().ok()?);
    Some(Duration::from_secs(u64::from(secs)))
}

/// TURN client
pub struct TurnClient {
    socket: Arc<UdpSocket>,
    config: TurnConfig,
    credentials: Option<Credentials>,
    allocation: Option<TurnAllocation>,
}

impl TurnClient {
    pub fn new(socket: Arc<UdpSocket>, config: TurnConfig) -> Self {
        Self {
            socket,
            config,
            credentials: None,
            allocation: None,
        }
    }

    /// Bind a fresh socket of the server's address family
    pub async fn bind(config: TurnConfig) -> Result<Self, TurnError> {
        let any: SocketAddr = if config.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(any).await?;
        Ok(Self::new(Arc::new(socket), config))
    }

    pub fn allocation(&self) -> Option<TurnAllocation> {
        self.allocation
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn allocate(&mut self) -> Result<TurnAllocation, TurnError> {
        let lifetime = self.config.lifetime.as_secs() as u32;
        let response = self
            .transact(METHOD_ALLOCATE, |msg| {
                msg.push(ATTR_REQUESTED_TRANSPORT, vec![TRANSPORT_UDP, 0, 0, 0]);
                msg.push(ATTR_LIFETIME, lifetime.to_be_bytes().to_vec());
            })
            .await?;

        let relayed = response
            .xor_address(ATTR_XOR_RELAYED_ADDRESS)
            .ok_or_else(|| TurnError::Malformed("no XOR-RELAYED-ADDRESS".into()))?;

        let allocation = TurnAllocation {
            relayed,
            mapped: response.xor_address(ATTR_XOR_MAPPED_ADDRESS),
            lifetime: lifetime_of(&response).unwrap_or(self.config.lifetime),
        };
        info!(server = %self.config.server, relayed = %allocation.relayed, lifetime_secs = allocation.lifetime.as_secs(), "TURN allocation created");

        self.allocation = Some(allocation);
        Ok(allocation)
    }

    pub async fn create_permission(&mut self, peer: SocketAddr) -> Result<(), TurnError> {
        if self.allocation.is_none() {
            return Err(TurnError::NotAllocated);
        }
        self.transact(METHOD_CREATE_PERMISSION, |msg| {
            msg.push_xor_address(ATTR_XOR_PEER_ADDRESS, peer);
        })
        .await?;
        debug!(%peer, "TURN permission installed");
        Ok(())
    }

    /// Refresh the allocation; returns the granted lifetime
    pub async fn refresh(&mut self) -> Result<Duration, TurnError> {
        if self.allocation.is_none() {
            return Err(TurnError::NotAllocated);
        }
        let lifetime = self.config.lifetime.as_secs() as u32;
        let response = self
            .transact(METHOD_REFRESH, |msg| {
                msg.push(ATTR_LIFETIME, lifetime.to_be_bytes().to_vec());
            })
            .await?;
        Ok(lifetime_of(&response).unwrap_or(self.config.lifetime))
    }

    /// Request with the long-term credential dance: an unauthenticated
    /// attempt, then one signed retry after 401, and a retry on a stale
    /// nonce (438)
    async fn transact(
        &mut self,
        method: u16,
        build: impl Fn(&mut StunMessage),
    ) -> Result<StunMessage, TurnError> {
        let mut challenged = false;
        let mut stale_retries = 0;

        loop {
            let transaction_id: [u8; 12] = rand::random();
            let mut msg = StunMessage::new(method, StunClass::Request, transaction_id);
            build(&mut msg);
            let bytes = match &self.credentials {
                Some(credentials) => credentials.sign(&mut msg),
                None => msg.encode(),
            };

            let response = self.request(&bytes, transaction_id).await?;
            if response.class == StunClass::Success {
                return Ok(response);
            }

            let (code, reason) = response.error_code().unwrap_or((0, "unspecified".into()));
            match code {
                401 if !challenged => {
                    challenged = true;
                    let realm = response
                        .text(ATTR_REALM)
                        .ok_or_else(|| TurnError::Malformed("401 without REALM".into()))?;
                    let nonce = response
                        .text(ATTR_NONCE)
                        .ok_or_else(|| TurnError::Malformed("401 without NONCE".into()))?;
                    trace!(%realm, "TURN challenge received");
                    self.credentials = Some(Credentials::new(
                        &self.config.username,
                        &self.config.password,
                        realm,
                        nonce,
                    ));
                }
                401 => return Err(TurnError::Unauthorized),
                438 if stale_retries < 2 => {
                    stale_retries += 1;
                    let nonce = response
                        .text(ATTR_NONCE)
                        .ok_or_else(|| TurnError::Malformed("438 without NONCE".into()))?;
                    if let Some(credentials) = self.credentials.as_mut() {
                        credentials.nonce = nonce;
                    }
                }
                _ => {
                    return Err(TurnError::Rejected {
                        method: method_name(method),
                        code,
                        reason,
                    })
                }
            }
        }
    }

    async fn request(&self, bytes: &[u8], transaction_id: [u8; 12]) -> Result<StunMessage, TurnError> {
        let server = self.config.server;
        let mut timeout = self.config.retry.initial_timeout;
        let mut buffer = vec![0u8; 2048];

        for _ in 0..self.config.retry.attempts {
            self.socket.send_to(bytes, server).await?;

            let deadline = Instant::now() + timeout;
            loop {
                let received =
                    tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buffer)).await;
                let (len, from) = match received {
                    Err(_) => break,
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => continue,
                    Ok(Err(e)) => return Err(e.into()),
                };
                if from != server {
                    continue;
                }
                match StunMessage::decode(&buffer[..len]) {
                    Ok(msg) if msg.transaction_id == transaction_id => return Ok(msg),
                    Ok(_) => trace!("ignoring TURN message for another transaction"),
                    Err(e) => trace!(error = %e, "ignoring undecodable datagram from TURN server"),
                }
            }
            timeout *= 2;
        }

        Err(TurnError::Timeout(server))
    }

    /// Turn the allocation into a link to `peer_relayed`, the peer's own
    /// relayed address. Starts the background refresh task.
    pub fn into_relay(self, peer_relayed: SocketAddr) -> Result<TurnRelay, TurnError> {
        let allocation = self.allocation.ok_or(TurnError::NotAllocated)?;
        let credentials = self.credentials.ok_or(TurnError::Unauthorized)?;

        let (nonce_tx, nonce_rx) = watch::channel(credentials.nonce.clone());
        let cancel = CancellationToken::new();

        let refresher = tokio::spawn(refresh_loop(
            self.socket.clone(),
            self.config.server,
            peer_relayed,
            credentials,
            nonce_rx,
            self.config.lifetime,
            self.config.refresh_interval,
            cancel.clone(),
        ));

        Ok(TurnRelay {
            socket: self.socket,
            server: self.config.server,
            peer: peer_relayed,
            relayed: allocation.relayed,
            nonce: nonce_tx,
            refresher,
            cancel,
        })
    }
}

/// Fire-and-forget Refresh and CreatePermission; responses are consumed
/// by the relay's receive path
#[allow(clippy::too_many_arguments)]
async fn refresh_loop(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    peer: SocketAddr,
    mut credentials: Credentials,
    nonce: watch::Receiver<String>,
    lifetime: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        credentials.nonce = nonce.borrow().clone();

        let mut refresh = StunMessage::new(METHOD_REFRESH, StunClass::Request, rand::random());
        refresh.push(ATTR_LIFETIME, (lifetime.as_secs() as u32).to_be_bytes().to_vec());
        let mut permission = StunMessage::new(METHOD_CREATE_PERMISSION, StunClass::Request, rand::random());
        permission.push_xor_address(ATTR_XOR_PEER_ADDRESS, peer);

        for msg in [&mut refresh, &mut permission] {
            let bytes = credentials.sign(msg);
            if let Err(e) = socket.send_to(&bytes, server).await {
                warn!(error = %e, "TURN refresh send failed");
            }
        }
        debug!(%server, "TURN allocation and permission refreshed");
    }
}

/// Relayed link to one peer through a TURN allocation
pub struct TurnRelay {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    peer: SocketAddr,
    relayed: SocketAddr,
    nonce: watch::Sender<String>,
    refresher: JoinHandle<()>,
    cancel: CancellationToken,
}

impl TurnRelay {
    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed
    }
}

impl Drop for TurnRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.refresher.abort();
    }
}

#[async_trait]
impl Datagram for TurnRelay {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut msg = StunMessage::new(METHOD_SEND, StunClass::Indication, rand::random());
        msg.push_xor_address(ATTR_XOR_PEER_ADDRESS, self.peer);
        msg.push(ATTR_DATA, data.to_vec());
        self.socket.send_to(&msg.encode(), self.server).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut packet = [0u8; 4096];

        loop {
            let (len, from) = match self.socket.recv_from(&mut packet).await {
                Ok(r) => r,
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => continue,
                Err(e) => return Err(e),
            };
            if from != self.server {
                continue;
            }

            let Ok(msg) = StunMessage::decode(&packet[..len]) else {
                continue;
            };

            match (msg.method, msg.class) {
                (METHOD_DATA, StunClass::Indication) => {
                    if msg.xor_address(ATTR_XOR_PEER_ADDRESS) != Some(self.peer) {
                        trace!("dropping relayed data from another peer");
                        continue;
                    }
                    let Some(data) = msg.attribute(ATTR_DATA) else {
                        continue;
                    };
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok(n);
                }
                (_, StunClass::Error) => match msg.error_code() {
                    Some((438, _)) => {
                        if let Some(nonce) = msg.text(ATTR_NONCE) {
                            debug!("TURN nonce went stale, next refresh uses the new one");
                            self.nonce.send_replace(nonce);
                        }
                    }
                    Some((code, reason)) => warn!(code, %reason, "TURN refresh rejected"),
                    None => {}
                },
                _ => {}
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn kind(&self) -> &'static str {
        "relay"
    }
}
