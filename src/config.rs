//! Configuration management for the swarmd daemon.
//!
//! A single TOML file with per-component sections. On first run, if no
//! config exists, one is auto-generated with defaults in the data
//! directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::network::peer::PeerAddress;

/// Get the platform-specific data directory for swarmd
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\swarmd
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("swarmd")
    } else {
        // Linux/Mac: ~/.swarmd
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".swarmd")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Network name carried in the handshake; nodes on different networks
    /// refuse each other
    pub network: String,
    /// Overrides the platform data directory when set
    pub data_dir: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "swarmd".to_string(),
            network: "testnet".to_string(),
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(get_data_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_address: String,
    /// Base connection target; all other ceilings derive from it
    pub max_connections: usize,
    /// Well-known bootstrap peers, also the authoritative reconciliation set
    pub seed_nodes: Vec<String>,
    pub max_reported_peers: usize,
    pub max_persisted_peers: usize,
    /// Persisted/reported peer records older than this are evicted
    pub peer_retention_days: u32,
    /// Seed connections beyond this are trimmed once min connectivity is met
    pub max_seed_connections: usize,
    /// Persisted peers with more failed attempts than this are evicted
    pub max_failed_attempts: u32,
    /// Connections without a peer address older than this are closed
    pub anonymous_grace_secs: u64,
    /// Delay between a new connection and the housekeeping run
    pub housekeeping_delay_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7340".to_string(),
            max_connections: 12,
            seed_nodes: Vec::new(),
            max_reported_peers: 1000,
            max_persisted_peers: 500,
            peer_retention_days: 14,
            max_seed_connections: 2,
            max_failed_attempts: 5,
            anonymous_grace_secs: 240,
            housekeeping_delay_secs: 10,
        }
    }
}

impl NetworkConfig {
    pub fn seed_addresses(&self) -> Vec<PeerAddress> {
        self.seed_nodes
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    pub fn peer_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.peer_retention_days) * 24 * 3600)
    }

    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits::from_max_connections(self.max_connections)
    }
}

/// Connection ceilings derived from one knob. The relationships mirror a
/// ladder that is widened step by step when closing excess connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub min_connections: usize,
    pub outbound_peer_trigger: usize,
    pub initial_data_exchange_trigger: usize,
    pub max_connections_absolute: usize,
}

impl ConnectionLimits {
    // max_connections default 12 -> min 8, outbound 16, initial 20, absolute 30
    pub fn from_max_connections(max_connections: usize) -> Self {
        let scaled = |factor: f64| (max_connections as f64 * factor).round() as usize;
        Self {
            max_connections,
            min_connections: scaled(0.7).max(1),
            outbound_peer_trigger: scaled(1.3).max(4),
            initial_data_exchange_trigger: scaled(1.7).max(8),
            max_connections_absolute: scaled(2.5).max(12),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Per-target share of the overall broadcast timeout
    pub per_peer_timeout_secs: u64,
    /// Fan-out cap when relaying someone else's data
    pub relay_fan_out: usize,
    /// Base for the randomized send stagger
    pub base_stagger_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            per_peer_timeout_secs: 90,
            relay_fan_out: 7,
            base_stagger_ms: 50,
        }
    }
}

impl BroadcastConfig {
    pub fn per_peer_timeout(&self) -> Duration {
        Duration::from_secs(self.per_peer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Lower bound of the randomized delay before announcing a new tip hash
    pub broadcast_delay_min_secs: u64,
    /// Upper bound of the randomized delay
    pub broadcast_delay_max_secs: u64,
    /// How many recent epochs to request from seeds after bootstrap
    pub request_window: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            broadcast_delay_min_secs: 5,
            broadcast_delay_max_secs: 15,
            request_window: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub ttl_days: u32,
    /// Newest-first load cap at startup, bounds memory
    pub max_loaded_items: usize,
    /// Persisted envelopes above this size are skipped at load time.
    /// Empirical cutoff for outlier payloads, not a protocol rule.
    pub max_entry_bytes: usize,
    /// Slow background re-publication of not-yet-expired items
    pub republish_enabled: bool,
    pub republish_chunk_size: usize,
    pub republish_cooldown_secs: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            ttl_days: 15,
            max_loaded_items: 5000,
            max_entry_bytes: 200 * 1024,
            republish_enabled: false,
            republish_chunk_size: 50,
            republish_cooldown_secs: 2,
        }
    }
}

impl MailboxConfig {
    pub fn ttl_ms(&self) -> i64 {
        i64::from(self.ttl_days) * 24 * 3600 * 1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path, e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse {}: {}", path, e))
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let content =
            toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize: {}", e))?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        fs::write(path, content).map_err(|e| format!("Failed to write {}: {}", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_ladder_from_default_knob() {
        let limits = ConnectionLimits::from_max_connections(12);
        assert_eq!(limits.min_connections, 8);
        assert_eq!(limits.outbound_peer_trigger, 16);
        assert_eq!(limits.initial_data_exchange_trigger, 20);
        assert_eq!(limits.max_connections_absolute, 30);
    }

    #[test]
    fn limits_ladder_floors() {
        let limits = ConnectionLimits::from_max_connections(2);
        assert_eq!(limits.min_connections, 1);
        assert_eq!(limits.outbound_peer_trigger, 4);
        assert_eq!(limits.initial_data_exchange_trigger, 8);
        assert_eq!(limits.max_connections_absolute, 12);
    }

    #[test]
    fn config_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.network.max_connections, 12);
        assert_eq!(parsed.mailbox.ttl_days, 15);
    }
}
