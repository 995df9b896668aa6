/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - STUN client and NAT classification
 * - Rendezvous record exchange (in-memory, manual, WebSocket signalling)
 * - UDP hole punching
 * - TURN relay fallback
 */

pub mod classify;
pub mod hole_punching;
pub mod rendezvous;
pub mod signalling;
pub mod stun;
pub mod turn;
pub mod types;

pub use classify::NatClassifier;
pub use hole_punching::{punch, HolePuncher, ProbeAuth, ProbePacket, PunchConfig, PunchError, PunchReport, PunchState};
pub use rendezvous::{
    ManualTransport, MemoryTransport, RendezvousChannel, RendezvousError, RendezvousRecord, RendezvousTransport,
    Stage,
};
pub use signalling::{SignallingMessage, WebSocketTransport};
pub use stun::{ProbeError, ProbeOutcome, ProbeResult, StunClient, StunConfig, StunResponse};
pub use turn::{TurnAllocation, TurnClient, TurnConfig, TurnError, TurnRelay};
pub use types::{
    punch_outlook, virtual_ip, ConnectionState, FilteringBehavior, MappingBehavior, NatProfile, NatTraversalConfig,
    NatType, PeerDescriptor, Protocol, PunchOutlook, TransportAddress,
};

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mesh::{Datagram, MeshSession, NetworkKey, PunchedSocket, SessionError};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no STUN server returned a reflexive address")]
    Discovery,

    #[error("rendezvous failed: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("expected peer {expected}, but {got} answered the rendezvous")]
    UnexpectedPeer { expected: String, got: String },

    #[error("no bidirectional path: local {local}, remote {remote}, punching was {outlook}")]
    NoPath {
        local: NatProfile,
        remote: NatProfile,
        outlook: PunchOutlook,
    },

    #[error("hole punching failed: {0}")]
    Punch(PunchError),

    #[error("relay fallback failed: {0}")]
    Relay(#[from] TurnError),

    #[error("session failed: {0}")]
    Session(#[from] SessionError),

    #[error("cancelled")]
    Cancelled,
}

/// Bind a UDP socket with SO_REUSEADDR set
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn bind(config: &NatTraversalConfig) -> Result<UdpSocket, ConnectError> {
    bind_udp(config.bind_addr).map_err(|source| ConnectError::Bind {
        addr: config.bind_addr,
        source,
    })
}

/// Probe the configured STUN servers from a fresh socket and classify
pub async fn probe_nat(config: &NatTraversalConfig) -> Result<(NatProfile, Vec<ProbeResult>), ConnectError> {
    let client = StunClient::new(bind(config)?, config.stun.clone());
    let probes = client.discover(&config.stun_servers).await;
    Ok((NatClassifier::classify(&probes), probes))
}

/// How the session reaches the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Direct,
    Relayed,
}

/// An established session and what both sides announced
#[derive(Debug)]
pub struct Connection {
    pub session: Arc<MeshSession>,
    pub local: PeerDescriptor,
    pub remote: PeerDescriptor,
    pub path: PathKind,
    /// Present when the path was punched
    pub punch: Option<PunchReport>,
}

/// Complete NAT traversal state machine
pub struct NatTraversal {
    config: NatTraversalConfig,
    key: NetworkKey,
    state: ConnectionState,
    cancel: CancellationToken,
}

impl NatTraversal {
    pub fn new(config: NatTraversalConfig, key: NetworkKey) -> Self {
        Self {
            config,
            key,
            state: ConnectionState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token aborts a running `connect`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!(from = ?self.state, to = ?state, "connection state");
        self.state = state;
    }

    /// Run the whole pipeline against `remote_peer_id`: discovery,
    /// rendezvous, punch (or relay) and the session handshake
    pub async fn connect(
        &mut self,
        remote_peer_id: &str,
        transport: Box<dyn RendezvousTransport>,
    ) -> Result<Connection, ConnectError> {
        let result = self.run(remote_peer_id, transport).await;
        match &result {
            Ok(conn) => {
                self.set_state(ConnectionState::Connected);
                info!(
                    peer = %conn.remote.peer_id,
                    path = ?conn.path,
                    link = conn.session.link_kind(),
                    virtual_ip = %conn.remote.virtual_ip,
                    "connected"
                );
            }
            Err(e) => {
                warn!(error = %e, "connection setup failed");
                self.set_state(ConnectionState::Failed(e.to_string()));
            }
        }
        result
    }

    async fn run(
        &mut self,
        remote_peer_id: &str,
        transport: Box<dyn RendezvousTransport>,
    ) -> Result<Connection, ConnectError> {
        // Step 1: STUN discovery
        self.set_state(ConnectionState::StunDiscovery);
        let socket = bind(&self.config)?;
        let stun = StunClient::new(socket, self.config.stun.clone());
        let probes = stun.discover(&self.config.stun_servers).await;
        let profile = NatClassifier::classify(&probes);
        let reflexive = profile.external_address.ok_or(ConnectError::Discovery)?;
        info!(%profile, local = ?stun.local_addr().ok(), "NAT discovery complete");

        let socket = Arc::new(stun.into_socket());
        let local = PeerDescriptor {
            peer_id: self.config.local_peer_id.clone(),
            reflexive_address: reflexive,
            nat_profile: profile,
            nonce: rand::random(),
            virtual_ip: virtual_ip(&self.config.network, &self.config.local_peer_id),
        };

        // Step 2: exchange records
        self.set_state(ConnectionState::Rendezvous);
        let mut channel = RendezvousChannel::new(
            transport,
            self.config.rendezvous_timeout,
            self.config.rendezvous_retransmit,
        );
        let record = RendezvousRecord::new(&local.peer_id, local.nonce, Stage::Direct, reflexive, profile.nat_type);
        let theirs = self.rendezvous(&mut channel, &record, remote_peer_id).await?;

        let remote = PeerDescriptor {
            peer_id: theirs.peer_id.clone(),
            reflexive_address: theirs.reflexive,
            nat_profile: NatProfile::advertised(theirs.nat_type, theirs.reflexive),
            nonce: theirs.nonce,
            virtual_ip: virtual_ip(&self.config.network, &theirs.peer_id),
        };
        let outlook = punch_outlook(profile.nat_type, theirs.nat_type);
        info!(
            peer = %remote.peer_id,
            reflexive = %remote.reflexive_address,
            nat = %remote.nat_profile.nat_type,
            %outlook,
            "peer record received"
        );

        // Step 3: punch; always attempted, even when unlikely
        self.set_state(ConnectionState::HolePunching);
        let auth = ProbeAuth::new(&self.key, local.nonce, remote.nonce);
        let punched = punch(
            socket.clone(),
            auth,
            remote.reflexive_address.socket_addr(),
            &self.config.punch,
            self.cancel.child_token(),
        )
        .await;

        let (link, path, report): (Box<dyn Datagram>, PathKind, Option<PunchReport>) = match punched {
            Ok(report) => {
                info!(remote = %report.remote, sent = report.sent, elapsed_ms = report.elapsed.as_millis() as u64, "hole punched");
                (
                    Box::new(PunchedSocket::new(socket, report.remote)),
                    PathKind::Direct,
                    Some(report),
                )
            }
            Err(PunchError::Exhausted { attempts, received }) => {
                warn!(attempts, received, %outlook, "hole punching exhausted");
                drop(socket);
                let relay = self.relay(&mut channel, &local, &remote, outlook).await?;
                (Box::new(relay), PathKind::Relayed, None)
            }
            Err(PunchError::Cancelled) => return Err(ConnectError::Cancelled),
            Err(e) => return Err(ConnectError::Punch(e)),
        };

        // Step 4: session handshake
        self.set_state(ConnectionState::Handshaking);
        let session = Arc::new(MeshSession::start(
            link,
            &self.key,
            local.clone(),
            remote.clone(),
            self.config.session.clone(),
        ));

        let established = tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectError::Cancelled),
            r = session.wait_established() => r.map_err(ConnectError::from),
        };
        if let Err(e) = established {
            session.close().await;
            return Err(e);
        }

        Ok(Connection {
            session,
            local,
            remote,
            path,
            punch: report,
        })
    }

    async fn rendezvous(
        &self,
        channel: &mut RendezvousChannel,
        record: &RendezvousRecord,
        remote_peer_id: &str,
    ) -> Result<RendezvousRecord, ConnectError> {
        let theirs = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectError::Cancelled),
            r = channel.exchange(record) => r?,
        };
        if theirs.peer_id != remote_peer_id {
            return Err(ConnectError::UnexpectedPeer {
                expected: remote_peer_id.to_string(),
                got: theirs.peer_id,
            });
        }
        Ok(theirs)
    }

    /// Allocate on the TURN server, swap relayed addresses with the peer
    /// in a second round and open a relayed link
    async fn relay(
        &mut self,
        channel: &mut RendezvousChannel,
        local: &PeerDescriptor,
        remote: &PeerDescriptor,
        outlook: PunchOutlook,
    ) -> Result<TurnRelay, ConnectError> {
        let no_path = || ConnectError::NoPath {
            local: local.nat_profile,
            remote: remote.nat_profile,
            outlook,
        };

        let Some(turn) = self.config.relay.clone() else {
            return Err(no_path());
        };

        self.set_state(ConnectionState::Relaying);
        let mut client = TurnClient::bind(turn).await?;
        let allocation = client.allocate().await?;

        let mut record = RendezvousRecord::new(
            &local.peer_id,
            local.nonce,
            Stage::Relay,
            local.reflexive_address,
            local.nat_profile.nat_type,
        );
        record.relay = Some(TransportAddress::udp(allocation.relayed));

        let theirs = self.rendezvous(channel, &record, &remote.peer_id).await?;
        let Some(peer_relayed) = theirs.relay else {
            warn!(peer = %remote.peer_id, "peer has no relay allocation");
            return Err(no_path());
        };

        client.create_permission(peer_relayed.socket_addr()).await?;
        info!(relayed = %allocation.relayed, peer_relayed = %peer_relayed, "using TURN relay");
        Ok(client.into_relay(peer_relayed.socket_addr())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_udp_picks_a_port() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn no_path_reports_both_profiles() {
        let local = NatProfile::advertised(NatType::Symmetric, TransportAddress::udp("203.0.113.1:40000".parse().unwrap()));
        let remote = NatProfile::advertised(NatType::Symmetric, TransportAddress::udp("198.51.100.5:50000".parse().unwrap()));
        let e = ConnectError::NoPath {
            local,
            remote,
            outlook: punch_outlook(NatType::Symmetric, NatType::Symmetric),
        };
        let text = e.to_string();
        assert!(text.contains("Symmetric NAT (external 203.0.113.1:40000)"));
        assert!(text.contains("198.51.100.5:50000"));
        assert!(text.contains("unlikely"));
    }
}
