//! Generic state hash chain monitoring.
//!
//! One instance per monitored state stream. Every epoch the locally
//! computed items are hashed on top of the previous digest and the new tip
//! is announced to peers after a small random delay; peer-reported hashes
//! are reconciled against the chain and conflicts surface as events. This
//! only *detects* divergence, it never resolves it.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::monitor::hash::{compute_digest, StateBlock, StateHash, StreamId};
use crate::network::broadcaster::Broadcaster;
use crate::network::connection::{Connection, PeerKind, Transport};
use crate::network::message::NetworkMessage;
use crate::network::peer::PeerAddress;
use crate::network::peer_manager::PeerManager;

/// The state-computation collaborator: delivers what changed in an epoch,
/// already filtered and sorted by a stable key.
pub trait EpochSource: Send + Sync {
    /// First epoch of this stream
    fn genesis_epoch(&self) -> u64;
    /// Serialized items for the epoch plus the item count
    fn serialized_items(&self, epoch: u64) -> (Vec<u8>, u64);
}

#[derive(Clone, Debug)]
pub enum MonitorEvent {
    /// The chain or a peer map changed
    HashesChanged { stream: StreamId },
    /// A peer reported a hash that differs from ours at that height
    ConflictDetected {
        stream: StreamId,
        height: u64,
        peer: String,
        with_seed: bool,
    },
}

pub struct StateMonitor {
    stream: StreamId,
    source: Arc<dyn EpochSource>,
    transport: Arc<dyn Transport>,
    peer_manager: Arc<PeerManager>,
    broadcaster: Arc<Broadcaster>,
    config: MonitorConfig,
    /// Strictly height-ordered, gapless once catch-up completed
    chain: RwLock<Vec<StateBlock>>,
    /// empty -> catching-up -> live; only live appends are announced
    caught_up: AtomicBool,
    conflict_with_seed: AtomicBool,
    conflict_with_non_seed: AtomicBool,
    events: broadcast::Sender<MonitorEvent>,
    cancel: CancellationToken,
}

impl StateMonitor {
    pub fn new(
        stream: StreamId,
        source: Arc<dyn EpochSource>,
        transport: Arc<dyn Transport>,
        peer_manager: Arc<PeerManager>,
        broadcaster: Arc<Broadcaster>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            stream,
            source,
            transport,
            peer_manager,
            broadcaster,
            config,
            chain: RwLock::new(Vec::new()),
            caught_up: AtomicBool::new(false),
            conflict_with_seed: AtomicBool::new(false),
            conflict_with_non_seed: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
        })
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn is_in_conflict_with_seed(&self) -> bool {
        self.conflict_with_seed.load(Ordering::SeqCst)
    }

    pub fn is_in_conflict_with_non_seed(&self) -> bool {
        self.conflict_with_non_seed.load(Ordering::SeqCst)
    }

    pub async fn chain_tip(&self) -> Option<StateHash> {
        self.chain.read().await.last().map(|b| b.my_hash.clone())
    }

    pub async fn chain_len(&self) -> usize {
        self.chain.read().await.len()
    }

    /// All locally held hashes at or above `from_height`, for catching a
    /// reconnected peer up without replaying the whole chain.
    pub async fn hashes_from(&self, from_height: u64) -> Vec<StateHash> {
        self.chain
            .read()
            .await
            .iter()
            .filter(|b| b.height() >= from_height)
            .map(|b| b.my_hash.clone())
            .collect()
    }

    ///////////////////////////////////////////////////////////////////////
    // Epoch boundaries
    ///////////////////////////////////////////////////////////////////////

    /// Evaluate the epoch that just closed. On the first observation with
    /// an empty chain every prior epoch is backfilled synchronously;
    /// listeners and peers only hear about the tip once that batch has
    /// fully finished.
    pub async fn on_epoch_boundary(self: &Arc<Self>, epoch: u64) {
        let genesis = self.source.genesis_epoch();
        if epoch < genesis {
            debug!("[{}] Ignoring epoch {} below genesis {}", self.stream, epoch, genesis);
            return;
        }

        let was_empty;
        {
            let mut chain = self.chain.write().await;
            was_empty = chain.is_empty();
            let start = match chain.last() {
                None => genesis,
                Some(last) => {
                    let expected = last.height() + 1;
                    if epoch < expected {
                        // Height going backwards is a programming or
                        // consistency error, never peer input
                        debug_assert!(
                            false,
                            "epoch {} below already-built height {}",
                            epoch,
                            last.height()
                        );
                        tracing::error!(
                            "[{}] Dropping out-of-order epoch {}; chain tip is {}",
                            self.stream,
                            epoch,
                            last.height()
                        );
                        return;
                    }
                    expected
                }
            };
            for height in start..=epoch {
                Self::append_epoch(&mut chain, &*self.source, height);
            }
        }

        if was_empty {
            info!(
                "[{}] Caught up to epoch {} from genesis {}",
                self.stream, epoch, genesis
            );
        }
        self.caught_up.store(true, Ordering::SeqCst);

        let _ = self.events.send(MonitorEvent::HashesChanged {
            stream: self.stream,
        });
        if let Some(tip) = self.chain_tip().await {
            self.broadcast_after_delay(tip);
        }
    }

    fn append_epoch(chain: &mut Vec<StateBlock>, source: &dyn EpochSource, height: u64) {
        let (serialized, item_count) = source.serialized_items(height);
        let previous = chain.last().map(|b| &b.my_hash.hash);
        let digest = compute_digest(previous, &serialized);
        chain.push(StateBlock::new(StateHash::new(height, digest, item_count)));
    }

    /// Announce the tip after a small random delay so peers are likely to
    /// already be at the same height when it arrives.
    fn broadcast_after_delay(self: &Arc<Self>, hash: StateHash) {
        let min = self.config.broadcast_delay_min_secs;
        let max = self.config.broadcast_delay_max_secs.max(min);
        let delay = Duration::from_secs(rand::thread_rng().gen_range(min..=max));
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = this.cancel.cancelled() => return,
            }
            let message = NetworkMessage::NewStateHash {
                stream: this.stream,
                hash,
            };
            this.broadcaster.broadcast(message, None, true);
        });
    }

    ///////////////////////////////////////////////////////////////////////
    // Peer reconciliation
    ///////////////////////////////////////////////////////////////////////

    /// Record a hash a peer announced for some height. Hashes above our
    /// own tip are ignored; the peer is ahead of us and we will get there.
    pub async fn on_peer_state_hash(
        &self,
        from: Option<PeerAddress>,
        connection_id: u64,
        hash: StateHash,
    ) {
        let peer_label = from
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| format!("unconfirmed-connection-{}", connection_id));
        let is_seed = match &from {
            Some(address) => self.peer_manager.is_seed(address).await,
            None => false,
        };

        let conflict_height = {
            let mut chain = self.chain.write().await;
            let Some(first_height) = chain.first().map(|b| b.height()) else {
                return;
            };
            let Some(last_height) = chain.last().map(|b| b.height()) else {
                return;
            };
            if hash.height < first_height || hash.height > last_height {
                return;
            }
            let index = (hash.height - first_height) as usize;
            let block = &mut chain[index];
            if block.put_peer_hash(peer_label.clone(), hash.clone()) {
                Some(block.height())
            } else {
                None
            }
        };

        if let Some(height) = conflict_height {
            if is_seed {
                self.conflict_with_seed.store(true, Ordering::SeqCst);
                warn!(
                    "[{}] State hash conflict with seed node {} at height {}: theirs={}",
                    self.stream, peer_label, height, hash
                );
            } else {
                // A single rogue peer is expected background noise
                self.conflict_with_non_seed.store(true, Ordering::SeqCst);
                debug!(
                    "[{}] State hash conflict with peer {} at height {}: theirs={}",
                    self.stream, peer_label, height, hash
                );
            }
            let _ = self.events.send(MonitorEvent::ConflictDetected {
                stream: self.stream,
                height,
                peer: peer_label,
                with_seed: is_seed,
            });
        }
        let _ = self.events.send(MonitorEvent::HashesChanged {
            stream: self.stream,
        });
    }

    /// A batch of hashes from a GetStateHashes response.
    pub async fn on_peer_state_hashes(
        &self,
        from: Option<PeerAddress>,
        connection_id: u64,
        hashes: Vec<StateHash>,
    ) {
        for hash in hashes {
            self.on_peer_state_hash(from.clone(), connection_id, hash)
                .await;
        }
    }

    /// Serve a peer's hash request from our chain.
    pub async fn on_hash_request(&self, connection: &Arc<Connection>, from_height: u64, nonce: u64) {
        let hashes = self.hashes_from(from_height).await;
        debug!(
            "[{}] Answering GetStateHashes(from={}) from {:?} with {} hash(es)",
            self.stream,
            from_height,
            connection.peer_address(),
            hashes.len()
        );
        let message = NetworkMessage::StateHashes {
            stream: self.stream,
            hashes,
            nonce,
        };
        if let Err(e) = self.transport.send(connection, message).await {
            debug!("[{}] Sending hashes response failed: {}", self.stream, e);
        }
    }

    /// On bootstrap completion: reconcile quickly against every connected
    /// authoritative node over a bounded recent window.
    pub async fn request_hashes_from_seeds(&self) {
        let from_height = match self.chain_tip().await {
            Some(tip) => tip
                .height
                .saturating_sub(self.config.request_window.saturating_sub(1)),
            None => self.source.genesis_epoch(),
        };
        for connection in self.transport.connections() {
            if connection.kind() != PeerKind::Seed {
                continue;
            }
            let nonce = rand::thread_rng().gen();
            let message = NetworkMessage::GetStateHashes {
                stream: self.stream,
                from_height,
                nonce,
            };
            if let Err(e) = self.transport.send(&connection, message).await {
                debug!(
                    "[{}] Hash request to seed {:?} failed: {}",
                    self.stream,
                    connection.peer_address(),
                    e
                );
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::network::connection::Direction;
    use crate::network::testing::MockTransport;
    use crate::storage::NodeStore;

    /// Deterministic items per epoch: `stream-items-<epoch>` repeated
    struct FixedSource {
        genesis: u64,
    }

    impl EpochSource for FixedSource {
        fn genesis_epoch(&self) -> u64 {
            self.genesis
        }

        fn serialized_items(&self, epoch: u64) -> (Vec<u8>, u64) {
            (format!("items-{}", epoch).into_bytes(), epoch % 7)
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        transport: Arc<MockTransport>,
        monitor: Arc<StateMonitor>,
    }

    fn setup(seed_nodes: Vec<String>) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::open(dir.path()).unwrap());
        let transport = Arc::new(MockTransport::new());
        let config = NetworkConfig {
            seed_nodes,
            ..NetworkConfig::default()
        };
        let peer_manager = PeerManager::new(transport.clone(), store, config);
        let broadcaster = Broadcaster::new(
            transport.clone(),
            Duration::from_millis(100),
            7,
            Duration::from_millis(1),
        );
        let monitor = StateMonitor::new(
            StreamId::Ledger,
            Arc::new(FixedSource { genesis: 0 }),
            transport.clone(),
            peer_manager,
            broadcaster,
            MonitorConfig {
                broadcast_delay_min_secs: 0,
                broadcast_delay_max_secs: 0,
                request_window: 5,
            },
        );
        Setup {
            _dir: dir,
            transport,
            monitor,
        }
    }

    #[tokio::test]
    async fn chain_linkage_holds_for_every_epoch() {
        let s = setup(vec![]);
        for epoch in 0..=3 {
            s.monitor.on_epoch_boundary(epoch).await;
        }

        let chain = s.monitor.chain.read().await;
        assert_eq!(chain.len(), 4);

        let mut previous: Option<[u8; 20]> = None;
        for (epoch, block) in chain.iter().enumerate() {
            let (items, count) = FixedSource { genesis: 0 }.serialized_items(epoch as u64);
            let expected = compute_digest(previous.as_ref(), &items);
            assert_eq!(block.my_hash.hash, expected);
            assert_eq!(block.my_hash.item_count, count);
            assert_eq!(block.height(), epoch as u64);
            previous = Some(block.my_hash.hash);
        }
    }

    #[tokio::test]
    async fn empty_chain_backfills_every_prior_epoch() {
        let s = setup(vec![]);
        s.monitor.on_epoch_boundary(5).await;

        let chain = s.monitor.chain.read().await;
        assert_eq!(chain.len(), 6);
        // Gapless and strictly ordered
        for (i, block) in chain.iter().enumerate() {
            assert_eq!(block.height(), i as u64);
        }
    }

    #[tokio::test]
    #[should_panic(expected = "below already-built height")]
    async fn out_of_order_epoch_is_fatal_in_debug_builds() {
        let s = setup(vec![]);
        s.monitor.on_epoch_boundary(3).await;
        s.monitor.on_epoch_boundary(2).await;
    }

    #[tokio::test]
    async fn conflicting_peer_hash_flags_exactly_that_height() {
        let s = setup(vec![]);
        for epoch in 0..=100 {
            s.monitor.on_epoch_boundary(epoch).await;
        }

        // Peer agrees below, diverges at 100
        let agreed = s.monitor.hashes_from(99).await[0].clone();
        assert_eq!(agreed.height, 99);
        let peer = PeerAddress::new("10.5.0.1", 7340);
        s.monitor
            .on_peer_state_hash(Some(peer.clone()), 1, agreed)
            .await;

        let mut wrong = s.monitor.chain_tip().await.unwrap();
        assert_eq!(wrong.height, 100);
        wrong.hash[0] ^= 0xff;
        s.monitor.on_peer_state_hash(Some(peer), 1, wrong).await;

        assert!(s.monitor.is_in_conflict_with_non_seed());
        // Conflict with a non-authoritative peer leaves the seed flag alone
        assert!(!s.monitor.is_in_conflict_with_seed());

        let chain = s.monitor.chain.read().await;
        for block in chain.iter() {
            if block.height() == 100 {
                assert_eq!(block.conflicts.len(), 1);
            } else {
                assert!(block.conflicts.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn seed_conflict_sets_the_seed_flag() {
        let s = setup(vec!["10.5.0.9:7340".to_string()]);
        s.monitor.on_epoch_boundary(0).await;

        let mut wrong = s.monitor.chain_tip().await.unwrap();
        wrong.hash[0] ^= 0xff;
        let seed = PeerAddress::new("10.5.0.9", 7340);
        s.monitor.on_peer_state_hash(Some(seed), 1, wrong).await;

        assert!(s.monitor.is_in_conflict_with_seed());
        assert!(!s.monitor.is_in_conflict_with_non_seed());
    }

    #[tokio::test]
    async fn peer_hash_above_tip_is_ignored() {
        let s = setup(vec![]);
        s.monitor.on_epoch_boundary(0).await;

        let ahead = StateHash::new(5, [1u8; 20], 0);
        s.monitor
            .on_peer_state_hash(Some(PeerAddress::new("10.5.0.2", 7340)), 1, ahead)
            .await;

        assert!(!s.monitor.is_in_conflict_with_non_seed());
        let chain = s.monitor.chain.read().await;
        assert!(chain[0].peer_hashes.is_empty());
    }

    #[tokio::test]
    async fn hash_request_is_served_from_height() {
        let s = setup(vec![]);
        for epoch in 0..=4 {
            s.monitor.on_epoch_boundary(epoch).await;
        }
        let requester = s
            .transport
            .add_connection(Some(PeerAddress::new("10.5.0.3", 7340)), Direction::Inbound);

        s.monitor.on_hash_request(&requester, 3, 42).await;

        let sent = s.transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            NetworkMessage::StateHashes { hashes, nonce, .. } => {
                assert_eq!(*nonce, 42);
                assert_eq!(hashes.len(), 2);
                assert_eq!(hashes[0].height, 3);
                assert_eq!(hashes[1].height, 4);
            }
            other => panic!("Expected StateHashes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn bootstrap_requests_recent_window_from_seeds_only() {
        let s = setup(vec!["10.5.0.9:7340".to_string()]);
        for epoch in 0..=9 {
            s.monitor.on_epoch_boundary(epoch).await;
        }
        let seed = s
            .transport
            .add_connection(Some(PeerAddress::new("10.5.0.9", 7340)), Direction::Outbound);
        seed.set_kind(PeerKind::Seed);
        s.transport
            .add_connection(Some(PeerAddress::new("10.5.0.4", 7340)), Direction::Outbound);

        s.monitor.request_hashes_from_seeds().await;

        let sent = s.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, seed.id());
        match &sent[0].1 {
            NetworkMessage::GetStateHashes { from_height, .. } => {
                // Tip 9, window 5: heights 5..=9
                assert_eq!(*from_height, 5);
            }
            other => panic!("Expected GetStateHashes, got {:?}", other),
        }
    }
}
