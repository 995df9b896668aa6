/**
 * nat_traversal/rendezvous.rs
 *
 * Out-of-band exchange of reflexive addresses and session nonces
 */

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::nat_traversal::types::{NatType, TransportAddress};

/// Major record version; peers on another major version cannot talk
pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("no rendezvous record from peer within {0:?}")]
    NoResponse(Duration),

    #[error("malformed rendezvous record: {0}")]
    Malformed(String),

    #[error("rendezvous version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("rendezvous transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Direct,
    Relay,
}

/// What a peer announces about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousRecord {
    pub v: u32,
    pub peer_id: String,
    pub nonce: u64,
    pub stage: Stage,
    pub reflexive: TransportAddress,
    pub nat_type: NatType,
    /// TURN relayed address, present in the relay stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<TransportAddress>,
    #[serde(default)]
    pub caps: Vec<String>,
}

#[derive(Deserialize)]
struct VersionProbe {
    v: u32,
}

impl RendezvousRecord {
    pub fn new(peer_id: &str, nonce: u64, stage: Stage, reflexive: TransportAddress, nat_type: NatType) -> Self {
        Self {
            v: RECORD_VERSION,
            peer_id: peer_id.to_string(),
            nonce,
            stage,
            reflexive,
            nat_type,
            relay: None,
            caps: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RendezvousError> {
        serde_json::to_vec(self).map_err(|e| RendezvousError::Malformed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, RendezvousError> {
        let probe: VersionProbe =
            serde_json::from_slice(data).map_err(|e| RendezvousError::Malformed(e.to_string()))?;
        if probe.v != RECORD_VERSION {
            return Err(RendezvousError::VersionMismatch {
                ours: RECORD_VERSION,
                theirs: probe.v,
            });
        }
        serde_json::from_slice(data).map_err(|e| RendezvousError::Malformed(e.to_string()))
    }

    fn key(&self) -> (String, u64, Stage) {
        (self.peer_id.clone(), self.nonce, self.stage)
    }
}

/// "Send an opaque blob to the peer, receive one from the peer", with
/// at-least-once delivery. `recv` must be cancel-safe.
#[async_trait]
pub trait RendezvousTransport: Send {
    async fn send(&mut self, blob: &[u8]) -> Result<(), RendezvousError>;

    async fn recv(&mut self) -> Result<Vec<u8>, RendezvousError>;
}

/// Record exchange over a transport. Remembers what it has already
/// accepted so retransmissions never surface twice.
pub struct RendezvousChannel {
    transport: Box<dyn RendezvousTransport>,
    timeout: Duration,
    retransmit: Duration,
    accepted: HashSet<(String, u64, Stage)>,
}

impl RendezvousChannel {
    pub fn new(transport: Box<dyn RendezvousTransport>, timeout: Duration, retransmit: Duration) -> Self {
        Self {
            transport,
            timeout,
            retransmit,
            accepted: HashSet::new(),
        }
    }

    /// Send `local` until the peer's record for the same stage arrives
    pub async fn exchange(&mut self, local: &RendezvousRecord) -> Result<RendezvousRecord, RendezvousError> {
        let blob = local.encode()?;
        self.transport.send(&blob).await?;
        debug!(peer = %local.peer_id, stage = ?local.stage, "sent rendezvous record");

        let deadline = Instant::now() + self.timeout;
        let mut next_send = Instant::now() + self.retransmit;

        loop {
            if Instant::now() >= deadline {
                return Err(RendezvousError::NoResponse(self.timeout));
            }

            let wake = deadline.min(next_send);
            let received = match tokio::time::timeout_at(wake, self.transport.recv()).await {
                Err(_) => {
                    if Instant::now() >= next_send {
                        trace!("retransmitting rendezvous record");
                        self.transport.send(&blob).await?;
                        next_send += self.retransmit;
                    }
                    continue;
                }
                Ok(r) => r?,
            };

            let record = RendezvousRecord::decode(&received)?;

            if record.peer_id == local.peer_id {
                trace!("ignoring own rendezvous record");
                continue;
            }
            if record.stage != local.stage {
                trace!(stage = ?record.stage, "ignoring record for another stage");
                continue;
            }
            if !self.accepted.insert(record.key()) {
                trace!(peer = %record.peer_id, "ignoring duplicate rendezvous record");
                continue;
            }

            // One more copy in case ours was lost after theirs went out
            self.transport.send(&blob).await?;

            info!(
                peer = %record.peer_id,
                reflexive = %record.reflexive,
                nat = %record.nat_type,
                stage = ?record.stage,
                "rendezvous complete"
            );
            return Ok(record);
        }
    }
}

/// In-process transport pair
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport { tx: a_tx, rx: a_rx },
            MemoryTransport { tx: b_tx, rx: b_rx },
        )
    }
}

#[async_trait]
impl RendezvousTransport for MemoryTransport {
    async fn send(&mut self, blob: &[u8]) -> Result<(), RendezvousError> {
        // A gone peer looks like silence
        let _ = self.tx.send(blob.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, RendezvousError> {
        match self.rx.recv().await {
            Some(blob) => Ok(blob),
            None => std::future::pending().await,
        }
    }
}

/// Copy/paste transport: prints base64 blobs and reads the peer's from
/// a line-based input
pub struct ManualTransport<R, W> {
    input: Lines<R>,
    output: W,
    last_sent: Option<Vec<u8>>,
}

impl ManualTransport<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> ManualTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: input.lines(),
            output,
            last_sent: None,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

#[async_trait]
impl<R, W> RendezvousTransport for ManualTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, blob: &[u8]) -> Result<(), RendezvousError> {
        // Retransmissions would only spam the terminal
        if self.last_sent.as_deref() == Some(blob) {
            return Ok(());
        }

        let text = format!(
            "\nSend this line to your peer:\n{}\n\nPaste your peer's line and press enter:\n",
            BASE64.encode(blob)
        );
        self.output
            .write_all(text.as_bytes())
            .await
            .map_err(|e| RendezvousError::Transport(e.to_string()))?;
        self.output
            .flush()
            .await
            .map_err(|e| RendezvousError::Transport(e.to_string()))?;

        self.last_sent = Some(blob.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, RendezvousError> {
        loop {
            let line = self
                .input
                .next_line()
                .await
                .map_err(|e| RendezvousError::Transport(e.to_string()))?;

            let Some(line) = line else {
                return std::future::pending().await;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return BASE64
                .decode(line)
                .map_err(|e| RendezvousError::Malformed(format!("not base64: {}", e)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(peer: &str, nonce: u64, stage: Stage) -> RendezvousRecord {
        RendezvousRecord::new(
            peer,
            nonce,
            stage,
            TransportAddress::udp("203.0.113.1:40000".parse().unwrap()),
            NatType::FullCone,
        )
    }

    fn channel(t: MemoryTransport) -> RendezvousChannel {
        RendezvousChannel::new(Box::new(t), Duration::from_millis(500), Duration::from_millis(50))
    }

    #[test]
    fn record_json_shape() {
        let json: serde_json::Value =
            serde_json::from_slice(&record("alice", 7, Stage::Direct).encode().unwrap()).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["stage"], "direct");
        assert_eq!(json["nat_type"], "full_cone");
        assert_eq!(json["reflexive"]["protocol"], "udp");
        assert!(json.get("relay").is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut json: serde_json::Value =
            serde_json::from_slice(&record("alice", 7, Stage::Direct).encode().unwrap()).unwrap();
        json["future_field"] = serde_json::json!({"x": 1});
        let decoded = RendezvousRecord::decode(json.to_string().as_bytes()).unwrap();
        assert_eq!(decoded, record("alice", 7, Stage::Direct));
    }

    #[test]
    fn version_mismatch_is_distinct() {
        let err = RendezvousRecord::decode(br#"{"v":2,"whatever":true}"#).unwrap_err();
        assert!(matches!(err, RendezvousError::VersionMismatch { ours: 1, theirs: 2 }));
        assert!(matches!(
            RendezvousRecord::decode(b"not json"),
            Err(RendezvousError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn peers_exchange_records() {
        let (a, b) = MemoryTransport::pair();
        let (mut a, mut b) = (channel(a), channel(b));
        let ra = record("alice", 1, Stage::Direct);
        let rb = record("bob", 2, Stage::Direct);

        let (got_b, got_a) = tokio::join!(a.exchange(&ra), b.exchange(&rb));
        assert_eq!(got_b.unwrap(), rb);
        assert_eq!(got_a.unwrap(), ra);
    }

    #[tokio::test]
    async fn echoes_and_duplicates_are_skipped() {
        let (a, mut b) = MemoryTransport::pair();
        let mut a = channel(a);
        let ra = record("alice", 1, Stage::Direct);
        let rb = record("bob", 2, Stage::Direct);

        b.send(&ra.encode().unwrap()).await.unwrap();
        b.send(&rb.encode().unwrap()).await.unwrap();
        b.send(&rb.encode().unwrap()).await.unwrap();
        assert_eq!(a.exchange(&ra).await.unwrap(), rb);

        // The buffered duplicate and stale-stage copies never surface again
        let relay = record("alice", 1, Stage::Relay);
        b.send(&record("bob", 2, Stage::Direct).encode().unwrap()).await.unwrap();
        let err = a.exchange(&relay).await.unwrap_err();
        assert!(matches!(err, RendezvousError::NoResponse(_)));
    }

    #[tokio::test]
    async fn local_record_is_retransmitted() {
        let (a, mut b) = MemoryTransport::pair();
        let mut a = channel(a);
        let ra = record("alice", 1, Stage::Direct);

        let exchange = tokio::spawn(async move { a.exchange(&ra).await });
        for _ in 0..3 {
            let blob = b.recv().await.unwrap();
            assert_eq!(RendezvousRecord::decode(&blob).unwrap().peer_id, "alice");
        }
        b.send(&record("bob", 2, Stage::Direct).encode().unwrap()).await.unwrap();
        assert_eq!(exchange.await.unwrap().unwrap().peer_id, "bob");
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (a, _b) = MemoryTransport::pair();
        let mut a = channel(a);
        let err = a.exchange(&record("alice", 1, Stage::Direct)).await.unwrap_err();
        assert!(matches!(err, RendezvousError::NoResponse(_)));
    }

    #[tokio::test]
    async fn malformed_blob_is_surfaced() {
        let (a, mut b) = MemoryTransport::pair();
        let mut a = channel(a);
        b.send(b"{\"v\":1}").await.unwrap();
        let err = a.exchange(&record("alice", 1, Stage::Direct)).await.unwrap_err();
        assert!(matches!(err, RendezvousError::Malformed(_)));
    }

    #[tokio::test]
    async fn manual_transport_prints_once_and_reads_base64() {
        let peer = record("bob", 2, Stage::Direct).encode().unwrap();
        let input = format!("\n{}\n", BASE64.encode(&peer));
        let mut manual = ManualTransport::new(BufReader::new(input.as_bytes()), Vec::new());

        manual.send(b"hello").await.unwrap();
        manual.send(b"hello").await.unwrap();
        assert_eq!(manual.recv().await.unwrap(), peer);

        let printed = String::from_utf8(manual.into_output()).unwrap();
        assert_eq!(printed.matches(&BASE64.encode(b"hello")).count(), 1);
    }
}
