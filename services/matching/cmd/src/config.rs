//! Configuration handling for the matchnet service.
//!
//! Settings come from an optional YAML file, then from `MATCHNET_*`
//! environment variables, then from command line flags.

use anyhow::Result;
use matchnet_session::SessionConfig;
use matchnet_wire::NetConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Socket transport the session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Reliable stream transport
    Tcp,
    /// Datagram transport with keepalive liveness
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            other => anyhow::bail!("unknown transport '{}'", other),
        }
    }
}

/// Matchnet service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Transport to serve
    pub transport: TransportKind,
    /// Listening port
    pub port: u16,
    /// Maximum concurrently connected nodes
    pub max_connections: usize,
    /// Peers to dial at startup, as `IP:port`
    pub peers: Vec<String>,
    /// Worker poll interval
    pub tick_interval: Duration,
    /// Interval between UDP keepalives
    pub keepalive_interval: Duration,
    /// Silence after which a UDP peer is dropped
    pub keepalive_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            transport: TransportKind::Tcp,
            port: NetConfig::MATCHING_SERVER_PORT,
            max_connections: NetConfig::PLAYER_MAX,
            peers: Vec::new(),
            tick_interval: session.tick_interval,
            keepalive_interval: session.keepalive_interval,
            keepalive_timeout: session.keepalive_timeout,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    matching: Option<MatchingSection>,
}

#[derive(Debug, Deserialize)]
struct MatchingSection {
    transport: Option<TransportKind>,
    port: Option<u16>,
    max_connections: Option<usize>,
    peers: Option<Vec<String>>,
    tick: Option<String>,
    keepalive_interval: Option<String>,
    keepalive_timeout: Option<String>,
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_environment_overrides();

        info!(
            "Final matchnet configuration: transport={}, port={}, max_connections={}, peers={}",
            config.transport,
            config.port,
            config.max_connections,
            config.peers.len()
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        let Some(section) = root.matching else {
            return Ok(());
        };

        if let Some(transport) = section.transport {
            self.transport = transport;
        }
        if let Some(port) = section.port {
            self.port = port;
        }
        if let Some(max) = section.max_connections {
            self.max_connections = max;
        }
        if let Some(peers) = section.peers {
            self.peers = peers;
        }
        if let Some(tick) = section.tick {
            self.tick_interval = humantime::parse_duration(&tick)?;
        }
        if let Some(interval) = section.keepalive_interval {
            self.keepalive_interval = humantime::parse_duration(&interval)?;
        }
        if let Some(timeout) = section.keepalive_timeout {
            self.keepalive_timeout = humantime::parse_duration(&timeout)?;
        }

        Ok(())
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `MATCHNET_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MATCHNET_TRANSPORT") {
            match value.parse::<TransportKind>() {
                Ok(transport) => {
                    self.transport = transport;
                    info!("Transport overridden by environment: {}", transport);
                }
                Err(e) => warn!("Ignoring MATCHNET_TRANSPORT: {}", e),
            }
        }

        if let Some(value) = lookup("MATCHNET_PORT") {
            if let Ok(port) = value.parse::<u16>() {
                self.port = port;
                info!("Port overridden by environment: {}", port);
            }
        }

        if let Some(value) = lookup("MATCHNET_MAX_CONNECTIONS") {
            if let Ok(max) = value.parse::<usize>() {
                self.max_connections = max;
                info!("Max connections overridden by environment: {}", max);
            }
        }
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            tick_interval: self.tick_interval,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            ..SessionConfig::default()
        }
    }
}

/// Split an `IP:port` peer entry
pub fn split_peer(peer: &str) -> Result<(&str, u16)> {
    let (address, port) = peer
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("peer '{}' is not in IP:port form", peer))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| anyhow::anyhow!("peer '{}' has an invalid port: {}", peer, e))?;
    Ok((address, port))
}
