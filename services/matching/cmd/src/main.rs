//! Matchnet echo node binary.
//!
//! Runs a TCP or UDP session on one port, dials any configured peers and
//! answers every received frame by sending it back to the node it came from.

use clap::Parser;
use matchnet_session::{
    PacketRouter, Session, SessionConfig, SessionEvent, TcpTransport, Transport, UdpTransport,
};
use matchnet_wire::PacketId;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{split_peer, ServerConfig, TransportKind};
use logging::MatchnetLogFormatter;

/// Matchmaking transport node
#[derive(Parser, Debug)]
#[command(name = "matchnet", version, about = "Matchmaking transport node over TCP or UDP")]
struct Args {
    /// Transport to serve (overrides the config file)
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Listening port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Maximum connected nodes (overrides the config file)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Peer to dial at startup, e.g. 192.168.0.10:50765 (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Worker poll interval, e.g. 5ms
    #[arg(long)]
    tick: Option<humantime::Duration>,

    /// UDP keepalive interval, e.g. 2s
    #[arg(long)]
    keepalive_interval: Option<humantime::Duration>,

    /// UDP liveness timeout, e.g. 10s
    #[arg(long)]
    keepalive_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "matchnet.yaml")]
    config: PathBuf,
}

impl Args {
    /// Layer command line flags over the loaded configuration
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if !self.connect.is_empty() {
            config.peers = self.connect.clone();
        }
        if let Some(tick) = self.tick {
            config.tick_interval = Duration::from(tick);
        }
        if let Some(interval) = self.keepalive_interval {
            config.keepalive_interval = Duration::from(interval);
        }
        if let Some(timeout) = self.keepalive_timeout {
            config.keepalive_timeout = Duration::from(timeout);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("matchnet={}", args.log_level).parse()?)
        .add_directive(format!("matchnet_session={}", args.log_level).parse()?)
        .add_directive(format!("matchnet_wire={}", args.log_level).parse()?);

    let formatter = MatchnetLogFormatter::new("matchnet");

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting matchnet v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    let session_config = config.session_config();

    info!(
        "Session config: transport={}, port={}, tick={:?}, keepalive={:?}, timeout={:?}",
        config.transport,
        config.port,
        config.tick_interval,
        config.keepalive_interval,
        config.keepalive_timeout
    );

    match config.transport {
        TransportKind::Tcp => run::<TcpTransport>(&config, session_config).await,
        TransportKind::Udp => run::<UdpTransport>(&config, session_config).await,
    }
}

/// Serve one session until Ctrl-C
async fn run<T: Transport>(
    config: &ServerConfig,
    session_config: SessionConfig,
) -> anyhow::Result<()> {
    let session = Arc::new(Session::<T>::new(session_config));
    let mut events = session.subscribe();

    let listen_addr = session
        .start_server(config.port, config.max_connections)
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen on port {}: {}", config.port, e))?;
    info!(component = "session", "Listening on {} ({})", listen_addr, T::KIND);

    let router = echo_router(&session);

    for peer in &config.peers {
        let (address, port) = match split_peer(peer) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(component = "session", "Skipping peer: {}", e);
                continue;
            }
        };
        match session.connect(address, port).await {
            Ok(node) => info!(component = "session", "Dialled {} as node {}", peer, node),
            Err(e) => warn!(component = "session", "Failed to dial {}: {}", peer, e),
        }
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut poll = tokio::time::interval(config.tick_interval);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Received Ctrl-C, shutting down");
                break;
            }
            Some(event) = events.recv() => log_event(event),
            _ = poll.tick() => {
                let echoed = router.poll(&session);
                if echoed > 0 {
                    debug!(component = "session", "Echoed {} frames", echoed);
                }
            }
        }
    }

    session.shutdown().await;
    info!("Matchnet stopped");
    Ok(())
}

/// Router that sends every frame back to the node it arrived from
fn echo_router<T: Transport>(session: &Arc<Session<T>>) -> PacketRouter {
    let router = PacketRouter::new();
    for packet_id in PacketId::ALL {
        let session = Arc::clone(session);
        router.register(packet_id, move |node, payload| {
            if let Err(e) = PacketRouter::send_frame(&session, node, packet_id, payload) {
                warn!(
                    component = "session",
                    "Echo of {} to node {} failed: {}",
                    packet_id,
                    node,
                    e
                );
            }
        });
    }
    router
}

fn log_event(event: SessionEvent) {
    match event {
        SessionEvent::Connected { node, peer } => match peer {
            Some(peer) => {
                info!(component = "session", "Node {} connected from {}", node, peer)
            }
            None => info!(component = "session", "Node {} connected", node),
        },
        SessionEvent::ConnectFailed { target } => {
            warn!(component = "session", "Connection to {} failed", target)
        }
        SessionEvent::Disconnected { node } => {
            info!(component = "session", "Node {} disconnected", node)
        }
        SessionEvent::TransportError { node, kind } => {
            warn!(component = "session", "Node {} transport error: {:?}", node, kind)
        }
    }
}
