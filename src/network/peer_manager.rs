//! Peer and connection admission management.
//!
//! Owns the two known-peer pools (reported: ephemeral, gossiped;
//! persisted: survives restart), enforces the connection-count ceilings
//! derived from `max_connections`, evicts stale records, and tells the
//! rest of the node when connectivity was lost or regained.
//!
//! Connections themselves are owned by the transport; this component only
//! observes, classifies and asks for closures.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{ClockEvent, ClockWatcher};
use crate::config::{ConnectionLimits, NetworkConfig};
use crate::network::connection::{
    CloseReason, Connection, Direction, PeerKind, RuleViolation, Transport,
};
use crate::network::peer::{Capability, Peer, PeerAddress};
use crate::storage::NodeStore;

/// Reported peers younger than this still count as live
const MAX_AGE_LIVE_PEERS_MS: i64 = 30 * 60 * 1000;
/// Headroom on top of the pool caps before a reported batch is a violation
const REPORTED_BATCH_SLACK: usize = 10;
/// Delay between closing one excess connection and re-checking the ceiling
const RECHECK_DELAY: Duration = Duration::from_millis(100);
/// Debounce for the capped persisted-peer snapshot write
const PERSIST_DELAY: Duration = Duration::from_millis(500);

/// The closed set of connectivity notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    AllConnectionsLost,
    NewConnectionAfterAllLost,
    /// The process was suspended past tolerance; rebootstrap even though
    /// sockets may still look open.
    AwakeFromStandby,
}

pub struct PeerManager {
    transport: Arc<dyn Transport>,
    store: Arc<NodeStore>,
    config: NetworkConfig,
    limits: ConnectionLimits,
    seed_addresses: RwLock<HashSet<PeerAddress>>,
    reported_peers: RwLock<HashMap<PeerAddress, Peer>>,
    persisted_peers: RwLock<HashMap<PeerAddress, Peer>>,
    latest_live_peers: RwLock<HashMap<PeerAddress, Peer>>,
    events: broadcast::Sender<ConnectivityEvent>,
    lost_all_connections: AtomicBool,
    stopped: AtomicBool,
    housekeeping_scheduled: AtomicBool,
    persistence_scheduled: AtomicBool,
    num_all_connections_lost_events: AtomicU32,
    peak_num_connections: AtomicUsize,
    cancel: CancellationToken,
}

impl PeerManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<NodeStore>,
        config: NetworkConfig,
    ) -> Arc<Self> {
        let limits = config.limits();
        let seed_addresses: HashSet<PeerAddress> = config.seed_addresses().into_iter().collect();
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            transport,
            store,
            limits,
            config,
            seed_addresses: RwLock::new(seed_addresses),
            reported_peers: RwLock::new(HashMap::new()),
            persisted_peers: RwLock::new(HashMap::new()),
            latest_live_peers: RwLock::new(HashMap::new()),
            events,
            lost_all_connections: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            housekeeping_scheduled: AtomicBool::new(false),
            persistence_scheduled: AtomicBool::new(false),
            num_all_connections_lost_events: AtomicU32::new(0),
            peak_num_connections: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Load the persisted peer pool. Call once before going online.
    pub async fn read_persisted(&self) -> Result<(), crate::error::StorageError> {
        let store = self.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load_peers())
            .await
            .map_err(|e| crate::error::StorageError::Serialization(e.to_string()))??;
        let mut persisted = self.persisted_peers.write().await;
        for peer in loaded {
            persisted.insert(peer.address.clone(), peer);
        }
        info!("Loaded {} persisted peer(s)", persisted.len());
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    pub async fn is_seed(&self, address: &PeerAddress) -> bool {
        self.seed_addresses.read().await.contains(address)
    }

    pub fn is_self(&self, address: &PeerAddress) -> bool {
        self.transport.local_address().as_ref() == Some(address)
    }

    pub fn has_sufficient_connections(&self) -> bool {
        self.confirmed_connection_count() >= self.limits.min_connections
    }

    fn confirmed_connection_count(&self) -> usize {
        self.transport
            .connections()
            .iter()
            .filter(|c| c.has_peer_address())
            .count()
    }

    pub fn num_all_connections_lost_events(&self) -> u32 {
        self.num_all_connections_lost_events.load(Ordering::Relaxed)
    }

    pub fn peak_num_connections(&self) -> usize {
        self.peak_num_connections.load(Ordering::Relaxed)
    }

    ///////////////////////////////////////////////////////////////////////
    // Connection lifecycle (invoked by the transport event dispatch)
    ///////////////////////////////////////////////////////////////////////

    pub async fn on_connection_established(self: &Arc<Self>, connection: &Arc<Connection>) {
        if let Some(address) = connection.peer_address() {
            if self.is_seed(&address).await {
                connection.set_kind(PeerKind::Seed);
            }
            let mut persisted = self.persisted_peers.write().await;
            if let Some(peer) = persisted.get_mut(&address) {
                peer.on_connection();
            }
        }

        self.schedule_housekeeping();

        if self.lost_all_connections.swap(false, Ordering::SeqCst) {
            self.stopped.store(false, Ordering::SeqCst);
            info!(
                "Established a new connection from/to {:?} after all connections lost",
                connection.peer_address()
            );
            let _ = self.events.send(ConnectivityEvent::NewConnectionAfterAllLost);
        }
    }

    pub async fn on_connection_closed(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        reason: CloseReason,
    ) {
        debug!(
            "Connection {} closed: peer={:?}, reason={:?}",
            connection.id(),
            connection.peer_address(),
            reason
        );
        if let Some(address) = connection.peer_address() {
            self.handle_connection_fault(&address, connection.violation().is_some())
                .await;
        }

        let previous = self.lost_all_connections.load(Ordering::SeqCst);
        let lost_all = self.transport.connections().is_empty();
        self.lost_all_connections.store(lost_all, Ordering::SeqCst);

        if lost_all {
            self.stopped.store(true, Ordering::SeqCst);
            if !previous {
                self.num_all_connections_lost_events
                    .fetch_add(1, Ordering::Relaxed);
                warn!("All connections lost");
                let _ = self.events.send(ConnectivityEvent::AllConnectionsLost);
            }
        }

        if reason.is_ban() {
            self.remove_banned_peer(connection).await;
        }
    }

    /// Record a connection fault against a peer. Evictions are advisory
    /// and idempotent; a missing record is a no-op.
    pub async fn handle_connection_fault(self: &Arc<Self>, address: &PeerAddress, violation: bool) {
        self.reported_peers.write().await.remove(address);

        let mut evict = violation;
        {
            let mut persisted = self.persisted_peers.write().await;
            if let Some(peer) = persisted.get_mut(address) {
                peer.on_disconnect();
                evict = evict || peer.failed_attempts > self.config.max_failed_attempts;
            }
        }

        if evict {
            self.persisted_peers.write().await.remove(address);
        } else {
            self.remove_too_old_persisted_peers().await;
        }
        self.request_persistence();
    }

    async fn remove_banned_peer(self: &Arc<Self>, connection: &Arc<Connection>) {
        if let Some(address) = connection.peer_address() {
            self.seed_addresses.write().await.remove(&address);
            self.persisted_peers.write().await.remove(&address);
            self.reported_peers.write().await.remove(&address);
            self.request_persistence();
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Reported peers (gossip)
    ///////////////////////////////////////////////////////////////////////

    /// Merge a peer-exchange batch into both pools. An oversized batch is
    /// a protocol violation flagged against the sender, not an error.
    pub async fn add_reported_peers(
        self: &Arc<Self>,
        peers: Vec<Peer>,
        from_connection: &Connection,
    ) {
        let max_batch = self.config.max_reported_peers
            + self.limits.max_connections_absolute
            + REPORTED_BATCH_SLACK;
        if peers.len() > max_batch {
            // Reported lists legitimately include the sender's connected
            // peers, hence the headroom above the cap.
            from_connection.report_violation(RuleViolation::TooManyReportedPeersSent);
            return;
        }

        let peers: Vec<Peer> = peers
            .into_iter()
            .filter(|p| !self.is_self(&p.address))
            .collect();
        debug!("Received {} reported peer(s)", peers.len());

        {
            let mut reported = self.reported_peers.write().await;
            for peer in &peers {
                reported.insert(peer.address.clone(), peer.clone());
            }
        }
        self.purge_reported_peers_if_exceeds().await;

        {
            let mut persisted = self.persisted_peers.write().await;
            for peer in peers {
                persisted.entry(peer.address.clone()).or_insert(peer);
            }
        }
        self.purge_persisted_peers_if_exceeds().await;
        self.request_persistence();
    }

    pub async fn reported_peers(&self) -> Vec<Peer> {
        self.reported_peers.read().await.values().cloned().collect()
    }

    pub async fn persisted_peers(&self) -> Vec<Peer> {
        self.persisted_peers.read().await.values().cloned().collect()
    }

    /// Every peer we know of: live, persisted and reported.
    pub async fn all_known_peers(&self) -> Vec<Peer> {
        let mut by_address: HashMap<PeerAddress, Peer> = HashMap::new();
        for peer in self.persisted_peers.read().await.values() {
            by_address.insert(peer.address.clone(), peer.clone());
        }
        for peer in self.reported_peers.read().await.values() {
            by_address.insert(peer.address.clone(), peer.clone());
        }
        for peer in self.get_live_peers(None).await {
            by_address.insert(peer.address.clone(), peer);
        }
        by_address.into_values().collect()
    }

    /// Recently-active non-seed peers, for answering peer-exchange
    /// requests. Retains peers seen in the last 30 minutes to avoid
    /// network partitioning on thin connectivity.
    pub async fn get_live_peers(&self, exclude: Option<&PeerAddress>) -> Vec<Peer> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut candidates: HashMap<PeerAddress, Peer> =
            self.latest_live_peers.read().await.clone();

        for connection in self.transport.connections() {
            let Some(address) = connection.peer_address() else {
                continue;
            };
            if self.is_seed(&address).await || Some(&address) == exclude {
                continue;
            }
            let capabilities = connection.capabilities();
            candidates.insert(
                address.clone(),
                Peer::with_capabilities(address, capabilities),
            );
        }

        candidates.retain(|_, peer| peer.age_ms(now) < MAX_AGE_LIVE_PEERS_MS);
        *self.latest_live_peers.write().await = candidates.clone();
        candidates.into_values().collect()
    }

    pub async fn peer_has_capability(&self, address: &PeerAddress, capability: Capability) -> bool {
        // Our own connection is authoritative; gossiped capabilities are a
        // fallback and may be stale or forged, which self-heals once we
        // talk to the peer directly.
        for connection in self.transport.connections() {
            if connection.peer_address().as_ref() == Some(address) {
                if connection.has_capability(capability) {
                    return true;
                }
                if !connection.capabilities().is_empty() {
                    return false;
                }
            }
        }
        if let Some(peer) = self.reported_peers.read().await.get(address) {
            if peer.has_capability(capability) {
                return true;
            }
        }
        self.persisted_peers
            .read()
            .await
            .get(address)
            .map(|p| p.has_capability(capability))
            .unwrap_or(false)
    }

    async fn purge_reported_peers_if_exceeds(&self) {
        let cap = self.config.max_reported_peers;
        let mut reported = self.reported_peers.write().await;
        if reported.len() <= cap {
            return;
        }
        info!(
            "Purging reported peers: {} exceeds cap of {}",
            reported.len(),
            cap
        );
        // Evict random entries rather than strictly the oldest so a peer
        // cannot engineer targeted eviction of honest records.
        let excess = reported.len() - cap;
        let mut rng = rand::thread_rng();
        for _ in 0..excess {
            let keys: Vec<PeerAddress> = reported.keys().cloned().collect();
            if keys.is_empty() {
                break;
            }
            let victim = keys[rng.gen_range(0..keys.len())].clone();
            reported.remove(&victim);
        }
    }

    async fn purge_persisted_peers_if_exceeds(&self) {
        let cap = self.config.max_persisted_peers;
        let mut persisted = self.persisted_peers.write().await;
        if persisted.len() <= cap {
            return;
        }
        let excess = persisted.len() - cap;
        let mut rng = rand::thread_rng();
        for _ in 0..excess {
            let keys: Vec<PeerAddress> = persisted.keys().cloned().collect();
            if keys.is_empty() {
                break;
            }
            let victim = keys[rng.gen_range(0..keys.len())].clone();
            persisted.remove(&victim);
        }
    }

    async fn remove_too_old_reported_peers(&self) {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.config.peer_retention().as_millis() as i64;
        self.reported_peers
            .write()
            .await
            .retain(|_, peer| peer.last_seen > cutoff);
    }

    async fn remove_too_old_persisted_peers(&self) {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.config.peer_retention().as_millis() as i64;
        self.persisted_peers
            .write()
            .await
            .retain(|_, peer| peer.last_seen > cutoff);
    }

    /// Debounced, capped snapshot write of the persisted pool.
    fn request_persistence(self: &Arc<Self>) {
        if self.persistence_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PERSIST_DELAY).await;
            this.persistence_scheduled.store(false, Ordering::SeqCst);
            let snapshot: Vec<Peer> = this.persisted_peers.read().await.values().cloned().collect();
            let store = this.store.clone();
            let cap = this.config.max_persisted_peers;
            let result =
                tokio::task::spawn_blocking(move || store.save_peers(&snapshot, cap)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Persisting peers failed: {}", e),
                Err(e) => warn!("Persisting peers panicked: {}", e),
            }
        });
    }

    ///////////////////////////////////////////////////////////////////////
    // Housekeeping
    ///////////////////////////////////////////////////////////////////////

    /// Run housekeeping once, debounced by a short delay after each new
    /// connection so connection bursts are handled in one pass.
    fn schedule_housekeeping(self: &Arc<Self>) {
        if self.housekeeping_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let delay = Duration::from_secs(self.config.housekeeping_delay_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = this.cancel.cancelled() => return,
            }
            this.housekeeping_scheduled.store(false, Ordering::SeqCst);
            if this.stopped.load(Ordering::SeqCst) {
                debug!("Stopped; skipping housekeeping run");
                return;
            }
            this.run_housekeeping().await;
        });
    }

    pub async fn run_housekeeping(self: &Arc<Self>) {
        let size = self.transport.connections().len();
        self.peak_num_connections
            .fetch_max(size, Ordering::Relaxed);

        self.remove_anonymous_connections().await;
        self.trim_seed_connections().await;
        self.remove_too_old_reported_peers().await;
        self.remove_too_old_persisted_peers().await;
        self.check_max_connections().await;
    }

    /// Close connections that still lack a peer address after the grace
    /// period. The grace is long: a bootstrapping peer may need a while
    /// until it knows its own address.
    async fn remove_anonymous_connections(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let grace_ms = self.config.anonymous_grace_secs as i64 * 1000;
        for connection in self.transport.connections() {
            if !connection.has_peer_address()
                && connection.kind() == PeerKind::Peer
                && now - connection.opened_at() > grace_ms
            {
                info!(
                    "Closing connection {}: peer address still unknown",
                    connection.id()
                );
                self.transport
                    .close(&connection, CloseReason::UnknownPeerAddress)
                    .await;
            }
        }
    }

    /// Once the minimum-connectivity floor is met we no longer need more
    /// than a couple of seed connections.
    async fn trim_seed_connections(&self) {
        if self.confirmed_connection_count() < self.limits.min_connections {
            return;
        }
        let mut seeds: Vec<Arc<Connection>> = self
            .transport
            .connections()
            .into_iter()
            .filter(|c| c.kind() == PeerKind::Seed)
            .collect();
        if seeds.len() <= self.config.max_seed_connections {
            return;
        }
        seeds.sort_by_key(|c| c.statistics().last_activity());
        let excess = seeds.len() - self.config.max_seed_connections;
        for connection in seeds.into_iter().take(excess) {
            info!(
                "Trimming excess seed connection to {:?}",
                connection.peer_address()
            );
            self.transport
                .close(&connection, CloseReason::TooManySeedConnections)
                .await;
        }
    }

    /// Enforce the connection ceiling by progressively widening the set of
    /// candidates to close, always dropping the least-recently-active one
    /// first, one at a time, re-checking after each closure.
    pub async fn check_max_connections(&self) -> bool {
        let mut closed_any = false;
        loop {
            let all = self.transport.connections();
            let size = all.len();
            if size <= self.limits.max_connections {
                break;
            }

            let mut candidates: Vec<Arc<Connection>> = all
                .iter()
                .filter(|c| c.direction() == Direction::Inbound && c.kind() == PeerKind::Peer)
                .cloned()
                .collect();

            if candidates.is_empty() {
                if size <= self.limits.outbound_peer_trigger {
                    break;
                }
                candidates = all
                    .iter()
                    .filter(|c| c.kind() == PeerKind::Peer)
                    .cloned()
                    .collect();
            }

            if candidates.is_empty() {
                if size <= self.limits.initial_data_exchange_trigger {
                    break;
                }
                candidates = all
                    .iter()
                    .filter(|c| c.kind() == PeerKind::InitialDataExchange)
                    .cloned()
                    .collect();
            }

            if candidates.is_empty() {
                if size <= self.limits.max_connections_absolute {
                    break;
                }
                candidates = all.clone();
            }

            let Some(connection) = candidates
                .into_iter()
                .min_by_key(|c| c.statistics().last_activity())
            else {
                break;
            };

            info!(
                "Too many connections open ({}); closing least active peer {:?}",
                size,
                connection.peer_address()
            );
            self.transport
                .close(&connection, CloseReason::TooManyConnections)
                .await;
            closed_any = true;
            tokio::time::sleep(RECHECK_DELAY).await;
        }
        closed_any
    }

    ///////////////////////////////////////////////////////////////////////
    // Standby handling
    ///////////////////////////////////////////////////////////////////////

    /// After a suspension the node re-arms as if it just recovered from
    /// total connectivity loss.
    pub fn listen_for_standby(self: &Arc<Self>, clock: &ClockWatcher) {
        let mut events = clock.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ClockEvent::AwakeFromStandby { .. }) => {
                            this.stopped.store(false, Ordering::SeqCst);
                            let _ = this.events.send(ConnectivityEvent::AwakeFromStandby);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
