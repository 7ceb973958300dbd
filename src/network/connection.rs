//! Live transport sessions as observed by the core.
//!
//! Connections are owned by the transport layer; this crate only observes
//! and classifies them. The [`Transport`] trait is the seam to the
//! concrete socket (or onion-routed) implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::NetworkError;
use crate::network::message::NetworkMessage;
use crate::network::peer::{Capability, PeerAddress};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Classification of the peer behind a connection. Determines how eagerly
/// the connection is closed when the ceiling is exceeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    /// Well-known bootstrap peer, higher-trust reconciliation source
    Seed,
    /// Carries direct (non-mailbox) user messages; protected from trimming
    DirectMessagePeer,
    /// Currently performing the initial data exchange
    InitialDataExchange,
    /// Ordinary peer
    Peer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    TooManyConnections,
    TooManySeedConnections,
    UnknownPeerAddress,
    PeerBanned,
    RuleViolation,
    Shutdown,
    Remote,
    IoError,
}

impl CloseReason {
    /// Ban-class closures evict the persisted peer record immediately.
    pub fn is_ban(&self) -> bool {
        matches!(self, CloseReason::PeerBanned | CloseReason::RuleViolation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleViolation {
    TooManyReportedPeersSent,
    OversizedFrame,
    MalformedMessage,
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleViolation::TooManyReportedPeersSent => write!(f, "too many reported peers sent"),
            RuleViolation::OversizedFrame => write!(f, "oversized frame"),
            RuleViolation::MalformedMessage => write!(f, "malformed message"),
        }
    }
}

/// Traffic counters, updated by the transport on every frame.
#[derive(Debug, Default)]
pub struct ConnectionStatistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    /// Unix millis of the last send or receive
    last_activity: AtomicI64,
}

impl ConnectionStatistics {
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// A live transport session to a peer.
///
/// Created by the transport on handshake completion and destroyed on
/// disconnect; the peer manager is notified of both transitions. The peer
/// address stays empty until the peer announces it (anonymous connection).
pub struct Connection {
    id: u64,
    direction: Direction,
    opened_at: i64,
    peer_address: RwLock<Option<PeerAddress>>,
    kind: RwLock<PeerKind>,
    capabilities: RwLock<HashSet<Capability>>,
    violation: RwLock<Option<RuleViolation>>,
    statistics: ConnectionStatistics,
}

impl Connection {
    pub fn new(id: u64, direction: Direction, peer_address: Option<PeerAddress>) -> Self {
        let statistics = ConnectionStatistics::default();
        statistics.touch();
        Self {
            id,
            direction,
            opened_at: chrono::Utc::now().timestamp_millis(),
            peer_address: RwLock::new(peer_address),
            kind: RwLock::new(PeerKind::Peer),
            capabilities: RwLock::new(HashSet::new()),
            violation: RwLock::new(None),
            statistics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn opened_at(&self) -> i64 {
        self.opened_at
    }

    pub fn peer_address(&self) -> Option<PeerAddress> {
        self.peer_address.read().clone()
    }

    pub fn set_peer_address(&self, address: PeerAddress) {
        *self.peer_address.write() = Some(address);
    }

    pub fn has_peer_address(&self) -> bool {
        self.peer_address.read().is_some()
    }

    pub fn kind(&self) -> PeerKind {
        *self.kind.read()
    }

    pub fn set_kind(&self, kind: PeerKind) {
        *self.kind.write() = kind;
    }

    pub fn capabilities(&self) -> HashSet<Capability> {
        self.capabilities.read().clone()
    }

    pub fn apply_capabilities(&self, capabilities: &[Capability]) {
        self.capabilities.write().extend(capabilities.iter().copied());
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.read().contains(&capability)
    }

    /// Record a protocol violation against the peer. The first violation
    /// sticks; repeat reports keep the original.
    pub fn report_violation(&self, violation: RuleViolation) {
        let mut cell = self.violation.write();
        if cell.is_none() {
            tracing::warn!(
                "Rule violation on connection {} ({:?}): {}",
                self.id,
                self.peer_address(),
                violation
            );
            *cell = Some(violation);
        }
    }

    pub fn violation(&self) -> Option<RuleViolation> {
        *self.violation.read()
    }

    pub fn statistics(&self) -> &ConnectionStatistics {
        &self.statistics
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("peer", &self.peer_address())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Lifecycle and message notifications from the transport. Delivered on a
/// broadcast channel so every interested component sees the same stream.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Established(Arc<Connection>),
    Closed(Arc<Connection>, CloseReason),
    Message(Arc<Connection>, NetworkMessage),
}

/// The seam to the transport/connection layer. The core only ever needs an
/// enumerable set of live connections, an async send primitive with a
/// success/failure result, and a way to close a session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our own announced address, if known yet
    fn local_address(&self) -> Option<PeerAddress>;

    /// Snapshot of all live connections
    fn connections(&self) -> Vec<Arc<Connection>>;

    async fn send(
        &self,
        connection: &Connection,
        message: NetworkMessage,
    ) -> Result<(), NetworkError>;

    async fn close(&self, connection: &Connection, reason: CloseReason);

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent>;
}

/// Live connections whose peer address is confirmed.
pub fn confirmed_connections(transport: &dyn Transport) -> Vec<Arc<Connection>> {
    transport
        .connections()
        .into_iter()
        .filter(|c| c.has_peer_address())
        .collect()
}

/// Look up a live connection to the given peer.
pub fn find_connection(transport: &dyn Transport, address: &PeerAddress) -> Option<Arc<Connection>> {
    transport
        .connections()
        .into_iter()
        .find(|c| c.peer_address().as_ref() == Some(address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_violation_sticks() {
        let connection = Connection::new(1, Direction::Inbound, None);
        connection.report_violation(RuleViolation::OversizedFrame);
        connection.report_violation(RuleViolation::MalformedMessage);
        assert_eq!(connection.violation(), Some(RuleViolation::OversizedFrame));
    }

    #[test]
    fn statistics_track_activity() {
        let connection = Connection::new(2, Direction::Outbound, None);
        let before = connection.statistics().last_activity();
        connection.statistics().record_sent(128);
        connection.statistics().record_received(64);
        assert_eq!(connection.statistics().bytes_sent(), 128);
        assert_eq!(connection.statistics().bytes_received(), 64);
        assert_eq!(connection.statistics().messages_sent(), 1);
        assert!(connection.statistics().last_activity() >= before);
    }

    #[test]
    fn anonymous_until_address_set() {
        let connection = Connection::new(3, Direction::Inbound, None);
        assert!(!connection.has_peer_address());
        connection.set_peer_address(PeerAddress::new("10.0.0.9", 7340));
        assert!(connection.has_peer_address());
    }
}
