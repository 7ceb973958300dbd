//! Peer identity and known-peer records.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Immutable network identity of a peer. Equality by value; used as the
/// map key throughout the crate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Missing port in peer address: {}", s))?;
        if host.is_empty() {
            return Err(format!("Missing host in peer address: {}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid port in peer address {}: {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

/// Negotiated feature flag a connection advertises. Gates whether certain
/// message types may be sent to that peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    PeerExchange,
    StateMonitor,
    Mailbox,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::PeerExchange => write!(f, "peer-exchange"),
            Capability::StateMonitor => write!(f, "state-monitor"),
            Capability::Mailbox => write!(f, "mailbox"),
        }
    }
}

/// A known network participant, independent of current connection state.
/// Lives in the reported pool (ephemeral, exchanged with peers) and the
/// persisted pool (survives restart).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub address: PeerAddress,
    /// Unix millis of the last observed activity
    pub last_seen: i64,
    pub failed_attempts: u32,
    #[serde(default)]
    pub capabilities: HashSet<Capability>,
}

impl Peer {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            last_seen: chrono::Utc::now().timestamp_millis(),
            failed_attempts: 0,
            capabilities: HashSet::new(),
        }
    }

    pub fn with_capabilities(address: PeerAddress, capabilities: HashSet<Capability>) -> Self {
        Self {
            address,
            last_seen: chrono::Utc::now().timestamp_millis(),
            failed_attempts: 0,
            capabilities,
        }
    }

    pub fn on_connection(&mut self) {
        self.last_seen = chrono::Utc::now().timestamp_millis();
        self.failed_attempts = 0;
    }

    pub fn on_disconnect(&mut self) {
        self.failed_attempts += 1;
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.last_seen
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

// Identity follows the address so pool maps and sets stay keyed by value.
impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}
