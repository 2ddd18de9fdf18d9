//! Node configuration
//!
//! All tunables live in [`NodeConfig`], grouped per component. Every group
//! implements `Default` with production values, and the whole tree can be
//! loaded from a JSON file and then overridden from the command line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid seed '{0}': expected host:port[:http_port]")]
    InvalidSeed(String),
    #[error("No seed nodes configured")]
    NoSeeds,
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

// =============================================================================
// Seed Nodes
// =============================================================================

/// A configured bootstrap entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    pub host: String,
    pub port: u16,
    pub http_port: u16,
}

impl SeedNode {
    pub fn new(host: impl Into<String>, port: u16, http_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            http_port,
        }
    }
}

impl FromStr for SeedNode {
    type Err = ConfigError;

    /// Parses `host:port` or `host:port:http_port`. Without an explicit HTTP
    /// port the node convention `port + 1` is assumed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSeed(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();

        let (host, port, http_port) = match parts.as_slice() {
            [host, port] => {
                let port: u16 = port.parse().map_err(|_| invalid())?;
                (*host, port, port.checked_add(1).ok_or_else(invalid)?)
            }
            [host, port, http] => (
                *host,
                port.parse().map_err(|_| invalid())?,
                http.parse().map_err(|_| invalid())?,
            ),
            _ => return Err(invalid()),
        };

        if host.is_empty() || port == 0 || http_port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port, http_port))
    }
}

impl fmt::Display for SeedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.http_port)
    }
}

// =============================================================================
// Component Configs
// =============================================================================

/// Peer registry limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of peers held at once
    pub max_peers: usize,
    /// Consecutive failures after which a peer is evicted
    pub failure_threshold: u32,
    /// How long evicted peers stay visible before purge
    pub evicted_retention_secs: u64,
    /// Persist the registry to `peers.json`
    pub persist: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_peers: 1000,
            failure_threshold: 3,
            evicted_retention_secs: 600,
            persist: true,
        }
    }
}

impl RegistryConfig {
    pub fn evicted_retention(&self) -> Duration {
        Duration::from_secs(self.evicted_retention_secs)
    }
}

/// External address discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    /// Explicit external address; disables probing when set
    pub external_address: Option<IpAddr>,
    /// Try a UPnP gateway before STUN
    pub enable_upnp: bool,
    /// STUN servers (`host:port`)
    pub stun_servers: Vec<String>,
    /// Plain-text "what is my IP" services
    pub http_services: Vec<String>,
    /// Per-probe timeout
    pub probe_timeout_secs: u64,
    /// Periodic re-check interval
    pub recheck_interval_secs: u64,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            external_address: None,
            enable_upnp: false,
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
                "stun.cloudflare.com:3478".to_string(),
            ],
            http_services: vec![
                "https://api.ipify.org".to_string(),
                "http://ifconfig.me/ip".to_string(),
                "http://icanhazip.com".to_string(),
            ],
            probe_timeout_secs: 3,
            recheck_interval_secs: 600,
        }
    }
}

impl AddressConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_interval_secs)
    }
}

/// Bootstrap and refresh behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub seeds: Vec<SeedNode>,
    pub connect_timeout_secs: u64,
    pub bootstrap_retry_secs: u64,
    pub refresh_interval_secs: u64,
    /// Healthy peers re-queried per refresh
    pub refresh_sample_size: usize,
    /// Breadth-first crawl depth below the seeds
    pub max_depth: usize,
    /// Peers accepted from a single peer-list response
    pub max_peers_per_response: usize,
    /// Pages followed per peer-list request
    pub max_pages: usize,
    pub page_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            connect_timeout_secs: 10,
            bootstrap_retry_secs: 5 * 60,
            refresh_interval_secs: 15 * 60,
            refresh_sample_size: 8,
            max_depth: 3,
            max_peers_per_response: 1000,
            max_pages: 4,
            page_size: 256,
        }
    }
}

impl DiscoveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn bootstrap_retry(&self) -> Duration {
        Duration::from_secs(self.bootstrap_retry_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Transport selection and circuit breaking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    pub request_timeout_secs: u64,
    /// Consecutive failed calls before a peer's circuit opens
    pub breaker_threshold: u32,
    pub breaker_base_backoff_ms: u64,
    pub breaker_max_backoff_secs: u64,
    /// How long a transport that worked stays first in line for a peer
    pub preference_ttl_secs: u64,
    pub max_connections_per_peer: usize,
    pub idle_timeout_secs: u64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            breaker_threshold: 3,
            breaker_base_backoff_ms: 1000,
            breaker_max_backoff_secs: 300,
            preference_ttl_secs: 300,
            max_connections_per_peer: 4,
            idle_timeout_secs: 60,
        }
    }
}

impl NegotiatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn breaker_base_backoff(&self) -> Duration {
        Duration::from_millis(self.breaker_base_backoff_ms)
    }

    pub fn breaker_max_backoff(&self) -> Duration {
        Duration::from_secs(self.breaker_max_backoff_secs)
    }

    pub fn preference_ttl(&self) -> Duration {
        Duration::from_secs(self.preference_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Gossip fanout, dedup and payload transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub bloom_bits: usize,
    pub bloom_hashes: u8,
    pub bloom_reset_secs: u64,
    /// Notifications are not forwarded past this many hops
    pub max_hops: u8,
    /// Payloads up to this size ride inside the notification
    pub inline_threshold: usize,
    /// Payloads above this size are always streamed in chunks
    pub stream_threshold: usize,
    pub chunk_size: usize,
    pub max_transaction_size: usize,
    pub payload_cache_entries: usize,
    pub chunk_timeout_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bloom_bits: 10_000_000,
            bloom_hashes: 3,
            bloom_reset_secs: 60 * 60,
            max_hops: 8,
            inline_threshold: 16 * 1024,
            stream_threshold: 1024 * 1024,
            chunk_size: 256 * 1024,
            max_transaction_size: 64 * 1024 * 1024,
            payload_cache_entries: 10_000,
            chunk_timeout_secs: 10,
        }
    }
}

impl GossipConfig {
    pub fn bloom_reset_interval(&self) -> Duration {
        Duration::from_secs(self.bloom_reset_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// Offline queue retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub drain_interval_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            drain_interval_secs: 30,
            max_backoff_secs: 600,
        }
    }
}

impl QueueConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Liveness probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub heartbeat_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_sample_size: usize,
    pub min_healthy_peers: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            probe_timeout_secs: 10,
            probe_sample_size: 16,
            min_healthy_peers: 5,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

// =============================================================================
// Node Config
// =============================================================================

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interface to bind listeners on
    pub listen_addr: IpAddr,
    /// Framed TCP port (RPC transport)
    pub port: u16,
    /// HTTP port (REST fallback, WebSocket streaming, operator API)
    pub http_port: u16,
    pub data_dir: PathBuf,
    pub registry: RegistryConfig,
    pub address: AddressConfig,
    pub discovery: DiscoveryConfig,
    pub negotiator: NegotiatorConfig,
    pub gossip: GossipConfig,
    pub queue: QueueConfig,
    pub health: HealthConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7400,
            http_port: 7401,
            data_dir: PathBuf::from(".gossip_data"),
            registry: RegistryConfig::default(),
            address: AddressConfig::default(),
            discovery: DiscoveryConfig::default(),
            negotiator: NegotiatorConfig::default(),
            gossip: GossipConfig::default(),
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Parse a comma-separated seed list and replace the configured seeds
    pub fn set_seeds(&mut self, seeds: &str) -> Result<(), ConfigError> {
        self.discovery.seeds = seeds
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SeedNode::from_str)
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    pub fn rpc_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    pub fn http_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.http_port)
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.seeds.is_empty() {
            return Err(ConfigError::NoSeeds);
        }
        if self.port != 0 && self.port == self.http_port {
            return Err(ConfigError::Invalid(format!(
                "port and http_port are both {}",
                self.port
            )));
        }
        if self.registry.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "registry.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.registry.max_peers == 0 {
            return Err(ConfigError::Invalid(
                "registry.max_peers must be at least 1".to_string(),
            ));
        }
        if self.gossip.bloom_bits == 0 || self.gossip.bloom_hashes == 0 {
            return Err(ConfigError::Invalid(
                "bloom filter needs at least one bit and one hash".to_string(),
            ));
        }
        let gossip = &self.gossip;
        if gossip.chunk_size == 0 || gossip.stream_threshold < gossip.inline_threshold {
            return Err(ConfigError::Invalid(
                "gossip.chunk_size must be positive and stream_threshold >= inline_threshold"
                    .to_string(),
            ));
        }
        if self.negotiator.breaker_threshold == 0 {
            return Err(ConfigError::Invalid(
                "negotiator.breaker_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_parsing() {
        let seed: SeedNode = "10.0.0.1:7400".parse().unwrap();
        assert_eq!(seed, SeedNode::new("10.0.0.1", 7400, 7401));

        let seed: SeedNode = "seed.example.org:9000:9100".parse().unwrap();
        assert_eq!(seed.http_port, 9100);

        assert!("nohost".parse::<SeedNode>().is_err());
        assert!("host:abc".parse::<SeedNode>().is_err());
        assert!(":7400".parse::<SeedNode>().is_err());
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.health.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.health.min_healthy_peers, 5);
        assert_eq!(config.registry.failure_threshold, 3);
        assert_eq!(config.discovery.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.discovery.bootstrap_retry(), Duration::from_secs(300));
        assert_eq!(config.discovery.refresh_interval(), Duration::from_secs(900));
        assert_eq!(config.gossip.bloom_bits, 10_000_000);
        assert_eq!(config.gossip.bloom_hashes, 3);
        assert_eq!(config.gossip.stream_threshold, 1024 * 1024);
    }

    #[test]
    fn test_validate_requires_seeds() {
        let mut config = NodeConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::NoSeeds)));

        config.set_seeds("127.0.0.1:7400, 127.0.0.2:7400:8000").unwrap();
        assert_eq!(config.discovery.seeds.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{ "port": 9000, "health": { "min_healthy_peers": 2 } }"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.http_port, 7401);
        assert_eq!(config.health.min_healthy_peers, 2);
        assert_eq!(config.health.probe_sample_size, 16);
    }

    #[test]
    fn test_port_collision_rejected() {
        let mut config = NodeConfig::default();
        config.set_seeds("127.0.0.1:7400").unwrap();
        config.http_port = config.port;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
