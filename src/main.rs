use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use meshlink::config::{MeshConfig, ENV_PASSPHRASE};
use meshlink::mesh::NetworkKey;
use meshlink::nat_traversal::{
    probe_nat, punch_outlook, ManualTransport, NatType, NatTraversal, PathKind, ProbeOutcome, ProbeResult, RendezvousTransport,
    WebSocketTransport,
};
use meshlink::tunnel::{ChannelAdapter, TunnelBridge, VirtualAdapter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// meshlink - encrypted peer-to-peer links through NAT
#[derive(Parser)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network name, overrides config and environment
    #[arg(short, long)]
    network: Option<String>,

    /// Local peer id, overrides config and environment
    #[arg(short, long)]
    peer_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the STUN servers and print the NAT profile
    Nat,

    /// Connect to a peer and open a line chat over the link
    Connect {
        /// The peer's id (like a username)
        remote_peer_id: String,

        /// Prompt for the passphrase instead of reading MESHLINK_PASSPHRASE
        #[arg(long)]
        ask_passphrase: bool,

        /// Use manual copy/paste even when a signalling URL is configured
        #[arg(long)]
        manual: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MeshConfig::load_or_default(cli.config.as_deref())?;
    if let Some(network) = cli.network {
        config.network.name = network;
    }
    if let Some(peer_id) = cli.peer_id {
        config.network.peer_id = Some(peer_id);
    }
    config.validate()?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match cli.command {
        Commands::Nat => run_nat(&config).await,
        Commands::Connect {
            remote_peer_id,
            ask_passphrase,
            manual,
        } => run_connect(&config, &remote_peer_id, ask_passphrase, manual).await,
    }
}

fn local_peer_id(config: &MeshConfig) -> String {
    config.network.peer_id.clone().unwrap_or_else(|| {
        let random_id = format!("peer_{}", rand::random::<u32>());
        println!("No peer id configured, using random ID: {}", random_id);
        random_id
    })
}

fn describe(probe: &ProbeResult) -> String {
    let kind = match (probe.change_ip, probe.change_port) {
        (false, false) => "binding",
        (true, true) => "change ip+port",
        (false, true) => "change port",
        (true, false) => "change ip",
    };
    let outcome = match &probe.outcome {
        ProbeOutcome::Mapped(r) => {
            let mut line = format!("mapped {} from {}", r.mapped.socket_addr(), r.responder);
            if let Some(other) = r.other_address {
                line.push_str(&format!(", alternate {}", other));
            }
            if let Some(software) = &r.server_software {
                line.push_str(&format!(" ({})", software));
            }
            line
        }
        ProbeOutcome::NoResponse => "no response".to_string(),
        ProbeOutcome::Unsupported => "not supported by server".to_string(),
        ProbeOutcome::Failed(e) => format!("failed: {}", e),
    };
    format!("  {:<15} {:<22} {}", kind, probe.server, outcome)
}

/// Probe the configured STUN servers and print what they said
async fn run_nat(config: &MeshConfig) -> Result<()> {
    let traversal_config = config.traversal_config("nat-probe").await?;
    if traversal_config.stun_servers.is_empty() {
        bail!("no STUN servers configured (set STUN_SERVER or [stun] servers)");
    }

    let (profile, probes) = probe_nat(&traversal_config).await?;

    println!("STUN responses:");
    for probe in &probes {
        println!("{}", describe(probe));
    }
    println!();
    println!("NAT type  : {}", profile.nat_type);
    println!("Mapping   : {:?}", profile.mapping);
    println!("Filtering : {:?}", profile.filtering);
    match profile.external_address {
        Some(addr) => println!("External  : {}", addr.socket_addr()),
        None => println!("External  : unknown"),
    }
    println!(
        "Punching against a port-restricted peer is {}",
        punch_outlook(profile.nat_type, NatType::PortRestrictedCone)
    );
    Ok(())
}

async fn read_passphrase(ask: bool) -> Result<String> {
    if !ask {
        if let Ok(passphrase) = std::env::var(ENV_PASSPHRASE) {
            return Ok(passphrase);
        }
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Network passphrase: ").await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    let passphrase = line.trim_end_matches(&['\r', '\n'][..]).to_string();
    if passphrase.is_empty() {
        bail!("empty passphrase; set {} or pass --ask-passphrase", ENV_PASSPHRASE);
    }
    Ok(passphrase)
}

/// Run the pipeline and chat over the resulting link
async fn run_connect(config: &MeshConfig, remote_peer_id: &str, ask_passphrase: bool, manual: bool) -> Result<()> {
    let peer_id = local_peer_id(config);
    if peer_id == remote_peer_id {
        bail!("cannot connect to yourself: local peer id is also {}", peer_id);
    }

    let passphrase = read_passphrase(ask_passphrase).await?;
    let kdf = config.kdf_params();
    let network = config.network.name.clone();
    let key = tokio::task::spawn_blocking(move || NetworkKey::derive(&network, &passphrase, &kdf))
        .await
        .context("key derivation task failed")??;

    let traversal_config = config.traversal_config(&peer_id).await?;

    println!("Configuration:");
    println!("  Network    : {}", config.network.name);
    println!("  Peer id    : {}", peer_id);
    println!("  Target     : {}", remote_peer_id);
    println!("  Key check  : {}", key.fingerprint());
    println!("  STUN       : {:?}", traversal_config.stun_servers);
    println!("  Relay      : {}", if traversal_config.relay.is_some() { "configured" } else { "none" });
    println!();

    let transport: Box<dyn RendezvousTransport> = match (&config.rendezvous.signalling_url, manual) {
        (Some(url), false) => Box::new(
            WebSocketTransport::connect(url, &peer_id, remote_peer_id, config.rendezvous.accept_invalid_certs)
                .await
                .context("failed to reach signalling server")?,
        ),
        _ => Box::new(ManualTransport::stdio()),
    };

    let mut nat = NatTraversal::new(traversal_config, key);
    let cancel = nat.cancel_token();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let connection = nat.connect(remote_peer_id, transport).await?;

    println!();
    println!(
        "Connected to {} ({}) over a {} path",
        connection.remote.peer_id,
        connection.remote.virtual_ip,
        match connection.path {
            PathKind::Direct => "direct",
            PathKind::Relayed => "relayed",
        }
    );
    println!("  You are {}", connection.local.virtual_ip);
    println!("Type a message and press Enter. Ctrl+C or EOF exits.");
    println!();

    chat(connection.session.clone(), config, cancel).await?;

    connection.session.close().await;
    ctrl_c.abort();
    let stats = connection.session.stats();
    info!(
        frames_in = stats.frames_in,
        frames_out = stats.frames_out,
        replays_rejected = stats.replays_rejected,
        auth_failures = stats.auth_failures,
        "session closed"
    );
    Ok(())
}

/// Lines become packets on an in-process adapter; the bridge fragments
/// and reassembles them like any other tunnelled traffic
async fn chat(session: Arc<meshlink::MeshSession>, config: &MeshConfig, cancel: CancellationToken) -> Result<()> {
    let (adapter, mut handle) = ChannelAdapter::pair(session.max_payload(), 64);
    let adapter: Arc<dyn VirtualAdapter> = Arc::new(adapter);
    let bridge = TunnelBridge::new(session.clone(), adapter, config.tunnel_config())?;
    let bridge = tokio::spawn(bridge.run(cancel.clone()));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            line = stdin.next_line() => match line? {
                Some(line) if line.is_empty() => {}
                Some(line) => {
                    if handle.inject(Bytes::from(line.into_bytes())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            packet = handle.next() => match packet {
                Some(packet) => println!("Peer: {}", String::from_utf8_lossy(&packet)),
                None => {
                    println!("Connection closed by peer.");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    match bridge.await {
        Ok(Ok(stats)) => debug!(?stats, "tunnel bridge stopped"),
        Ok(Err(e)) => debug!(error = %e, "tunnel bridge failed"),
        Err(e) => debug!(error = %e, "tunnel bridge task panicked"),
    }
    Ok(())
}
