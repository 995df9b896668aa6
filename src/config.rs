/**
 * config.rs
 *
 * TOML configuration with environment overrides
 */

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::mesh::{KdfParams, SessionConfig, FRAME_OVERHEAD};
use crate::nat_traversal::{NatTraversalConfig, PunchConfig, StunConfig, TurnConfig};
use crate::tunnel::fragment::TUNNEL_HEADER_LEN;
use crate::tunnel::TunnelConfig;

pub const ENV_NETWORK: &str = "MESHLINK_NETWORK";
pub const ENV_PEER_ID: &str = "MESHLINK_PEER_ID";
pub const ENV_PASSPHRASE: &str = "MESHLINK_PASSPHRASE";
pub const ENV_STUN_SERVER: &str = "STUN_SERVER";
pub const ENV_SIGNALLING_URL: &str = "SIGNALLING_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub network: NetworkSection,
    pub stun: StunSection,
    pub rendezvous: RendezvousSection,
    pub punch: PunchSection,
    pub session: SessionSection,
    pub tunnel: TunnelSection,
    /// TURN fallback; absent means no relay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelaySection>,
    pub kdf: KdfSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub bind_addr: SocketAddr,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            name: "meshlink".to_string(),
            peer_id: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunSection {
    /// host:port entries, resolved at startup
    pub servers: Vec<String>,
    pub attempts: u32,
    pub initial_timeout_ms: u64,
}

impl Default for StunSection {
    fn default() -> Self {
        Self {
            servers: vec!["stun.l.google.com:19302".to_string()],
            attempts: 3,
            initial_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSection {
    /// WebSocket signalling relay; manual copy/paste when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signalling_url: Option<String>,
    pub accept_invalid_certs: bool,
    pub timeout_secs: u64,
    pub retransmit_ms: u64,
}

impl Default for RendezvousSection {
    fn default() -> Self {
        Self {
            signalling_url: None,
            accept_invalid_certs: true,
            timeout_secs: 120,
            retransmit_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PunchSection {
    pub interval_ms: u64,
    pub attempts: u32,
    pub linger: u32,
}

impl Default for PunchSection {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            attempts: 15,
            linger: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub keepalive_secs: u64,
    pub degraded_secs: u64,
    pub close_secs: u64,
    pub hello_interval_ms: u64,
    pub handshake_timeout_secs: u64,
    pub max_invalid_hellos: u32,
    pub max_datagram: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keepalive_secs: 10,
            degraded_secs: 30,
            close_secs: 90,
            hello_interval_ms: 500,
            handshake_timeout_secs: 10,
            max_invalid_hellos: 8,
            max_datagram: 1400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub reassembly_timeout_ms: u64,
    pub max_reassemblies: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            reassembly_timeout_ms: 5000,
            max_reassemblies: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    pub server: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_relay_lifetime")]
    pub lifetime_secs: u64,
}

fn default_relay_lifetime() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfSection {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfSection {
    fn default() -> Self {
        let params = KdfParams::default();
        Self {
            memory_kib: params.memory_kib,
            iterations: params.iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Resolve `host:port`, preferring an address of the same family as `bind`
async fn resolve(entry: &str, bind: SocketAddr) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(entry)
        .await
        .with_context(|| format!("failed to resolve {}", entry))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4() == bind.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("{} resolved to no addresses", entry))
}

impl MeshConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// File if given, otherwise defaults; then the process environment
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup(ENV_NETWORK) {
            self.network.name = name;
        }
        if let Some(peer_id) = lookup(ENV_PEER_ID) {
            self.network.peer_id = Some(peer_id);
        }
        if let Some(servers) = lookup(ENV_STUN_SERVER) {
            self.stun.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = lookup(ENV_SIGNALLING_URL) {
            self.rendezvous.signalling_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.name.is_empty() {
            bail!("network name must not be empty");
        }
        if matches!(&self.network.peer_id, Some(id) if id.is_empty() || id.len() > 255) {
            bail!("peer id must be 1-255 bytes");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            bail!(
                "invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.stun.attempts == 0 || self.punch.attempts == 0 {
            bail!("STUN and punch attempts must be at least 1");
        }

        let s = &self.session;
        if !(s.keepalive_secs < s.degraded_secs && s.degraded_secs < s.close_secs) {
            bail!("session timers must satisfy keepalive < degraded < close");
        }
        if s.max_datagram <= FRAME_OVERHEAD + TUNNEL_HEADER_LEN || s.max_datagram > 65_507 {
            bail!(
                "max_datagram must be between {} and 65507",
                FRAME_OVERHEAD + TUNNEL_HEADER_LEN + 1
            );
        }

        if self.kdf.memory_kib < 8 || self.kdf.iterations == 0 {
            bail!("KDF memory must be at least 8 KiB and iterations at least 1");
        }

        Ok(())
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf.memory_kib,
            iterations: self.kdf.iterations,
            ..KdfParams::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            keepalive_interval: Duration::from_secs(s.keepalive_secs),
            degraded_after: Duration::from_secs(s.degraded_secs),
            close_after: Duration::from_secs(s.close_secs),
            hello_interval: Duration::from_millis(s.hello_interval_ms),
            handshake_timeout: Duration::from_secs(s.handshake_timeout_secs),
            max_invalid_hellos: s.max_invalid_hellos,
            max_datagram: s.max_datagram,
        }
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            reassembly_timeout: Duration::from_millis(self.tunnel.reassembly_timeout_ms),
            max_reassemblies: self.tunnel.max_reassemblies,
        }
    }

    /// Resolve hostnames and build the traversal config for `peer_id`
    pub async fn traversal_config(&self, peer_id: &str) -> Result<NatTraversalConfig> {
        let bind = self.network.bind_addr;

        let mut stun_servers = Vec::with_capacity(self.stun.servers.len());
        for entry in &self.stun.servers {
            stun_servers.push(resolve(entry, bind).await?);
        }

        let relay = match &self.relay {
            Some(r) => Some(TurnConfig {
                lifetime: Duration::from_secs(r.lifetime_secs),
                ..TurnConfig::new(resolve(&r.server, bind).await?, &r.username, &r.password)
            }),
            None => None,
        };

        Ok(NatTraversalConfig {
            network: self.network.name.clone(),
            local_peer_id: peer_id.to_string(),
            bind_addr: bind,
            stun_servers,
            stun: StunConfig {
                attempts: self.stun.attempts,
                initial_timeout: Duration::from_millis(self.stun.initial_timeout_ms),
            },
            rendezvous_timeout: Duration::from_secs(self.rendezvous.timeout_secs),
            rendezvous_retransmit: Duration::from_millis(self.rendezvous.retransmit_ms),
            punch: PunchConfig {
                interval: Duration::from_millis(self.punch.interval_ms),
                attempts: self.punch.attempts,
                linger: self.punch.linger,
            },
            session: self.session_config(),
            relay,
        })
    }
}
