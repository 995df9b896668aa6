/**
 * nat_traversal/hole_punching.rs
 *
 * UDP hole punching with tagged probe packets
 *
 *   magic "MLPB"(4) | kind(1) | seq(4) | tag(16)
 */

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use zeroize::Zeroizing;

use crate::mesh::NetworkKey;

pub const PROBE_MAGIC: &[u8; 4] = b"MLPB";
pub const PROBE_LEN: usize = 25;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum PunchError {
    #[error("hole punching exhausted {attempts} attempts ({received} valid packets received)")]
    Exhausted { attempts: u32, received: u32 },

    #[error("hole punching cancelled")]
    Cancelled,

    #[error("hole punching socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PunchConfig {
    pub interval: Duration,
    /// Probe budget before giving up
    pub attempts: u32,
    /// Extra probes sent after confirmation, in intervals
    pub linger: u32,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            attempts: 15,
            linger: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeKind {
    Probe = 1,
    Reply = 2,
}

/// UDP probe packet structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePacket {
    pub kind: ProbeKind,
    pub seq: u32,
    pub tag: [u8; TAG_LEN],
}

impl ProbePacket {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PROBE_LEN);

        // Magic marker (4 bytes)
        bytes.extend_from_slice(PROBE_MAGIC);

        // Kind (1 byte)
        bytes.push(self.kind as u8);

        // Sequence number (4 bytes)
        bytes.extend_from_slice(&self.seq.to_be_bytes());

        // Tag (16 bytes)
        bytes.extend_from_slice(&self.tag);

        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != PROBE_LEN || &data[0..4] != PROBE_MAGIC {
            return None;
        }

        let kind = match data[4] {
            1 => ProbeKind::Probe,
            2 => ProbeKind::Reply,
            _ => return None,
        };
        let seq = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[9..]);

        Some(Self { kind, seq, tag })
    }

    /// Cheap check for telling probes apart from session frames
    pub fn is_probe(data: &[u8]) -> bool {
        data.len() >= 4 && &data[0..4] == PROBE_MAGIC
    }
}

/// Creates and verifies probe tags for one pair of session nonces
#[derive(Clone)]
pub struct ProbeAuth {
    key: Zeroizing<[u8; 32]>,
    local_nonce: u64,
    remote_nonce: u64,
}

impl ProbeAuth {
    pub fn new(key: &NetworkKey, local_nonce: u64, remote_nonce: u64) -> Self {
        Self {
            key: key.punch_key(),
            local_nonce,
            remote_nonce,
        }
    }

    fn tag(&self, kind: ProbeKind, seq: u32, sender_nonce: u64, receiver_nonce: u64) -> [u8; TAG_LEN] {
        let mut message = [0u8; 21];
        message[0] = kind as u8;
        message[1..5].copy_from_slice(&seq.to_be_bytes());
        message[5..13].copy_from_slice(&sender_nonce.to_be_bytes());
        message[13..].copy_from_slice(&receiver_nonce.to_be_bytes());

        let hash = blake3::keyed_hash(&self.key, &message);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&hash.as_bytes()[..TAG_LEN]);
        tag
    }

    pub fn packet(&self, kind: ProbeKind, seq: u32) -> ProbePacket {
        ProbePacket {
            kind,
            seq,
            tag: self.tag(kind, seq, self.local_nonce, self.remote_nonce),
        }
    }

    /// Parse and authenticate a packet sent by the remote peer
    pub fn verify(&self, data: &[u8]) -> Option<ProbePacket> {
        let packet = ProbePacket::from_bytes(data)?;
        let expected = self.tag(packet.kind, packet.seq, self.remote_nonce, self.local_nonce);
        (expected == packet.tag).then_some(packet)
    }

    /// Reply bytes for a valid remote Probe
    pub fn answer(&self, data: &[u8]) -> Option<Vec<u8>> {
        match self.verify(data) {
            Some(p) if p.kind == ProbeKind::Probe => {
                Some(self.packet(ProbeKind::Reply, p.seq).to_bytes())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    Idle,
    Punching,
    Confirmed,
    Failed,
}

/// One probe sent by the send task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchAttempt {
    pub sequence_number: u32,
    pub sent_at: Instant,
    pub acked: bool,
}

/// Result of handling one inbound datagram
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Inbound {
    /// Reply to send back to the peer
    pub reply: Option<Vec<u8>>,
    /// This packet confirmed the path
    pub confirmed: bool,
}

/// Receive/decide side of the punch. Holds no socket; the async driver
/// feeds it sends and datagrams.
pub struct HolePuncher {
    auth: ProbeAuth,
    remote: SocketAddr,
    state: PunchState,
    attempts: Vec<PunchAttempt>,
    /// Replies that arrived before their attempt was reported
    early_replies: HashSet<u32>,
    sent: u32,
    received: u32,
    rejected: u32,
    started_at: Option<Instant>,
    confirmed_at: Option<Instant>,
}

impl HolePuncher {
    pub fn new(auth: ProbeAuth, remote: SocketAddr) -> Self {
        Self {
            auth,
            remote,
            state: PunchState::Idle,
            attempts: Vec::new(),
            early_replies: HashSet::new(),
            sent: 0,
            received: 0,
            rejected: 0,
            started_at: None,
            confirmed_at: None,
        }
    }

    pub fn state(&self) -> PunchState {
        self.state
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    pub fn attempts(&self) -> &[PunchAttempt] {
        &self.attempts
    }

    /// Both reflexive addresses are known
    pub fn start(&mut self, now: Instant) {
        if self.state == PunchState::Idle {
            self.state = PunchState::Punching;
            self.started_at = Some(now);
        }
    }

    /// Record a probe that was sent successfully
    pub fn on_attempt(&mut self, mut attempt: PunchAttempt, now: Instant) -> bool {
        self.sent += 1;
        if self.early_replies.remove(&attempt.sequence_number) {
            attempt.acked = true;
            self.attempts.push(attempt);
            return self.confirm(now);
        }
        self.attempts.push(attempt);
        false
    }

    /// Handle a datagram received while punching
    pub fn on_packet(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Inbound {
        if from != self.remote {
            trace!(%from, expected = %self.remote, "discarding packet from unexpected address");
            return Inbound::default();
        }

        let Some(packet) = self.auth.verify(data) else {
            self.rejected += 1;
            trace!(%from, "discarding unauthenticated packet");
            return Inbound::default();
        };
        self.received += 1;

        match packet.kind {
            ProbeKind::Probe => Inbound {
                reply: Some(self.auth.packet(ProbeKind::Reply, packet.seq).to_bytes()),
                confirmed: false,
            },
            ProbeKind::Reply => {
                let matched = self
                    .attempts
                    .iter_mut()
                    .find(|a| a.sequence_number == packet.seq);

                let confirmed = match matched {
                    Some(attempt) => {
                        attempt.acked = true;
                        self.confirm(now)
                    }
                    None => {
                        self.early_replies.insert(packet.seq);
                        false
                    }
                };

                Inbound {
                    reply: None,
                    confirmed,
                }
            }
        }
    }

    fn confirm(&mut self, now: Instant) -> bool {
        if self.state != PunchState::Punching {
            return false;
        }
        self.state = PunchState::Confirmed;
        self.confirmed_at = Some(now);
        true
    }

    /// The send task has used its whole budget
    pub fn on_budget_exhausted(&mut self) {
        if self.state == PunchState::Punching {
            self.state = PunchState::Failed;
        }
    }

    pub fn elapsed_to_confirm(&self) -> Option<Duration> {
        Some(self.confirmed_at?.duration_since(self.started_at?))
    }
}

/// Summary of a confirmed punch
#[derive(Debug, Clone)]
pub struct PunchReport {
    pub remote: SocketAddr,
    pub sent: u32,
    pub received: u32,
    pub elapsed: Duration,
}

/// Send loop: one probe per interval until the budget runs out, or for
/// `linger` more probes once confirmed
async fn send_probes(
    socket: Arc<UdpSocket>,
    auth: ProbeAuth,
    remote: SocketAddr,
    config: PunchConfig,
    confirmed: watch::Receiver<bool>,
    cancel: CancellationToken,
    attempts: mpsc::Sender<PunchAttempt>,
) {
    let mut seq: u32 = 1;
    let mut linger_left: Option<u32> = None;

    loop {
        if linger_left.is_none() && *confirmed.borrow() {
            linger_left = Some(config.linger);
        }

        match linger_left {
            Some(0) => break,
            None if seq > config.attempts => {
                // Leave room for replies to the last probe
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(config.interval) => {}
                }
                break;
            }
            _ => {}
        }

        let probe = auth.packet(ProbeKind::Probe, seq).to_bytes();
        match socket.send_to(&probe, remote).await {
            Ok(_) => {
                trace!(%remote, seq, "sent punch probe");
                let attempt = PunchAttempt {
                    sequence_number: seq,
                    sent_at: Instant::now(),
                    acked: false,
                };
                if attempts.send(attempt).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!(%remote, seq, error = %e, "punch probe send failed"),
        }

        seq += 1;
        if let Some(n) = linger_left.as_mut() {
            *n -= 1;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

/// Punch a path to `remote` from `socket`
pub async fn punch(
    socket: Arc<UdpSocket>,
    auth: ProbeAuth,
    remote: SocketAddr,
    config: &PunchConfig,
    cancel: CancellationToken,
) -> Result<PunchReport, PunchError> {
    let (attempt_tx, mut attempt_rx) = mpsc::channel(32);
    let (confirmed_tx, confirmed_rx) = watch::channel(false);
    let sender_cancel = cancel.child_token();

    let sender = tokio::spawn(send_probes(
        socket.clone(),
        auth.clone(),
        remote,
        config.clone(),
        confirmed_rx,
        sender_cancel.clone(),
        attempt_tx,
    ));

    info!(%remote, attempts = config.attempts, interval_ms = config.interval.as_millis() as u64, "starting UDP hole punching");

    let mut puncher = HolePuncher::new(auth, remote);
    puncher.start(Instant::now());

    let mut buffer = vec![0u8; 2048];
    let result = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Err(PunchError::Cancelled),

            attempt = attempt_rx.recv() => match attempt {
                Some(attempt) => {
                    if puncher.on_attempt(attempt, Instant::now()) {
                        let _ = confirmed_tx.send(true);
                    }
                }
                None => break Ok(()),
            },

            received = socket.recv_from(&mut buffer) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) if matches!(e.kind(), std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused) => continue,
                    Err(e) => break Err(PunchError::Io(e)),
                };

                let inbound = puncher.on_packet(from, &buffer[..len], Instant::now());
                if let Some(reply) = inbound.reply {
                    if let Err(e) = socket.send_to(&reply, from).await {
                        debug!(%from, error = %e, "punch reply send failed");
                    }
                }
                if inbound.confirmed {
                    let _ = confirmed_tx.send(true);
                }
            }
        }
    };

    sender_cancel.cancel();
    let _ = sender.await;
    result?;

    if puncher.state() != PunchState::Confirmed {
        puncher.on_budget_exhausted();
        info!(%remote, sent = puncher.sent(), received = puncher.received(), "hole punching failed");
        return Err(PunchError::Exhausted {
            attempts: config.attempts,
            received: puncher.received(),
        });
    }

    let report = PunchReport {
        remote,
        sent: puncher.sent(),
        received: puncher.received(),
        elapsed: puncher.elapsed_to_confirm().unwrap_or_default(),
    };
    info!(%remote, sent = report.sent, received = report.received, elapsed_ms = report.elapsed.as_millis() as u64, "hole punched");
    Ok(report)
}
