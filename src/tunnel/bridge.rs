/**
 * tunnel/bridge.rs
 *
 * Forwards packets between a virtual adapter and a mesh session
 */

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::mesh::{MeshSession, SessionState};
use crate::tunnel::adapter::VirtualAdapter;
use crate::tunnel::fragment::{Fragmenter, Reassembler};
use crate::tunnel::TunnelError;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub reassembly_timeout: Duration,
    pub max_reassemblies: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout: Duration::from_secs(5),
            max_reassemblies: 64,
        }
    }
}

/// Traffic statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub packets_out: u64,
    pub packets_in: u64,
    pub fragments_out: u64,
    pub fragments_in: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub dropped_degraded: u64,
    pub dropped_oversize: u64,
    pub send_failures: u64,
    pub malformed: u64,
    pub reassembly_timeouts: u64,
    pub reassembly_evictions: u64,
}

pub struct TunnelBridge {
    session: Arc<MeshSession>,
    adapter: Arc<dyn VirtualAdapter>,
    config: TunnelConfig,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    stats: BridgeStats,
    stats_tx: watch::Sender<BridgeStats>,
}

impl TunnelBridge {
    pub fn new(
        session: Arc<MeshSession>,
        adapter: Arc<dyn VirtualAdapter>,
        config: TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let fragmenter = Fragmenter::new(session.max_payload())?;
        let reassembler = Reassembler::new(config.reassembly_timeout, config.max_reassemblies);
        let (stats_tx, _) = watch::channel(BridgeStats::default());

        Ok(Self {
            session,
            adapter,
            config,
            fragmenter,
            reassembler,
            stats: BridgeStats::default(),
            stats_tx,
        })
    }

    /// Live view of the bridge counters
    pub fn stats(&self) -> watch::Receiver<BridgeStats> {
        self.stats_tx.subscribe()
    }

    /// Forward until the session closes, the adapter fails, or `cancel`
    /// fires. Returns the final counters.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<BridgeStats, TunnelError> {
        let mut status = self.session.subscribe();
        let mut sweep = tokio::time::interval((self.config.reassembly_timeout / 4).max(Duration::from_millis(10)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            peer = %self.session.remote().peer_id,
            chunk = self.fragmenter.chunk_size(),
            adapter_mtu = self.adapter.mtu(),
            "tunnel bridge running"
        );

        let session = self.session.clone();
        let adapter = self.adapter.clone();

        loop {
            let state = status.borrow().state;
            if state == SessionState::Closed {
                info!("session closed, stopping tunnel bridge");
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,

                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                packet = adapter.read() => {
                    let packet = packet?;
                    self.outbound(packet, state).await;
                }

                payload = session.recv() => match payload {
                    Some(payload) => self.inbound(payload).await?,
                    None => break,
                },

                _ = sweep.tick() => {
                    let expired = self.reassembler.expire(Instant::now());
                    if expired > 0 {
                        debug!(expired, "discarded incomplete packets");
                        self.stats.reassembly_timeouts += expired as u64;
                    }
                }
            }

            self.stats.reassembly_evictions = self.reassembler.evicted();
            self.stats_tx.send_replace(self.stats.clone());
        }

        self.stats_tx.send_replace(self.stats.clone());
        Ok(self.stats)
    }

    async fn outbound(&mut self, packet: Bytes, state: SessionState) {
        if state != SessionState::Established {
            self.stats.dropped_degraded += 1;
            trace!(?state, len = packet.len(), "dropping outbound packet");
            return;
        }

        let fragments = match self.fragmenter.split(&packet) {
            Ok(f) => f,
            Err(e) => {
                self.stats.dropped_oversize += 1;
                debug!(error = %e, "dropping outbound packet");
                return;
            }
        };

        for fragment in fragments {
            if let Err(e) = self.session.send(fragment).await {
                self.stats.send_failures += 1;
                debug!(error = %e, "fragment send failed");
                return;
            }
            self.stats.fragments_out += 1;
        }
        self.stats.packets_out += 1;
        self.stats.bytes_out += packet.len() as u64;
    }

    async fn inbound(&mut self, payload: Bytes) -> Result<(), TunnelError> {
        self.stats.fragments_in += 1;

        match self.reassembler.push(&payload, Instant::now()) {
            Ok(Some(packet)) => {
                self.adapter.write(&packet.data).await?;
                self.stats.packets_in += 1;
                self.stats.bytes_in += packet.data.len() as u64;
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.malformed += 1;
                debug!(error = %e, "dropping inbound fragment");
            }
        }
        Ok(())
    }
}
