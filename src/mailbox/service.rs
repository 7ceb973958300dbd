//! Store-and-forward encrypted mailbox messaging.
//!
//! Direct delivery is attempted first; when the recipient is unreachable
//! the sealed envelope is published into the shared replicated store and
//! picked up whenever the recipient comes online. Every envelope observed
//! in the store is tried against our own key exactly once; failures are
//! remembered across restarts. Decrypted messages are handed to listeners
//! repeatedly and idempotently, since republishing can deliver
//! semantically identical content as distinct envelopes.

use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::envelope::{KeyRing, MailboxEntry, MailboxItem, MailboxMessage, OpenOutcome};
use crate::mailbox::ignored::IgnoredMailbox;
use crate::mailbox::store::{DataStore, DataStoreEvent};
use crate::network::connection::{find_connection, Transport};
use crate::network::message::NetworkMessage;
use crate::network::peer::{Capability, PeerAddress};
use crate::network::peer_manager::PeerManager;
use crate::storage::NodeStore;

/// Retry delay for acknowledgements arriving before bootstrap completed
const DEFERRED_ACK_DELAY: Duration = Duration::from_secs(30);
/// Cadence of expiry purges (store entries + ignored records)
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub enum MailboxEvent {
    MessageArrived {
        message: MailboxMessage,
        sender_key: VerifyingKey,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered directly to the online recipient
    Arrived,
    /// Recipient unreachable; sealed into the replicated store
    StoredInMailbox,
}

pub struct MailboxService {
    transport: Arc<dyn Transport>,
    peer_manager: Arc<PeerManager>,
    data_store: Arc<DataStore>,
    node_store: Arc<NodeStore>,
    keyring: Arc<KeyRing>,
    ignored: IgnoredMailbox,
    config: MailboxConfig,
    /// Keyed by uid: the decrypted message id for our items, the envelope
    /// id for foreign ones
    items: RwLock<HashMap<String, MailboxItem>>,
    bootstrapped: AtomicBool,
    events: broadcast::Sender<MailboxEvent>,
    cancel: CancellationToken,
}

impl MailboxService {
    pub fn new(
        transport: Arc<dyn Transport>,
        peer_manager: Arc<PeerManager>,
        data_store: Arc<DataStore>,
        node_store: Arc<NodeStore>,
        keyring: Arc<KeyRing>,
        config: MailboxConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let ignored = IgnoredMailbox::new(node_store.clone());
        Arc::new(Self {
            transport,
            peer_manager,
            data_store,
            node_store,
            keyring,
            ignored,
            config,
            items: RwLock::new(HashMap::new()),
            bootstrapped: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    /// Our messages that arrived but were not acknowledged yet.
    pub async fn my_messages(&self) -> Vec<MailboxMessage> {
        self.items
            .read()
            .await
            .values()
            .filter_map(|item| item.decrypted.clone())
            .collect()
    }

    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    ///////////////////////////////////////////////////////////////////////
    // Startup
    ///////////////////////////////////////////////////////////////////////

    /// Load persisted items newest-first up to the cap, skipping expired
    /// and oversized envelopes. Logs a per-day histogram of the volume.
    pub async fn load_persisted(&self) -> Result<(), MailboxError> {
        let node_store = self.node_store.clone();
        let mut persisted = tokio::task::spawn_blocking(move || node_store.load_mailbox_items())
            .await
            .map_err(|e| crate::error::StorageError::Serialization(e.to_string()))??;
        persisted.sort_by_key(|item| std::cmp::Reverse(item.entry.created_at));

        let now = chrono::Utc::now().timestamp_millis();
        let mut per_day: HashMap<i64, usize> = HashMap::new();
        let mut expired = 0usize;
        let mut oversized = 0usize;
        let mut loaded = 0usize;

        let mut items = self.items.write().await;
        for item in persisted {
            if loaded >= self.config.max_loaded_items {
                break;
            }
            if item.is_expired(now) {
                expired += 1;
                continue;
            }
            if item.entry.approximate_size() > self.config.max_entry_bytes {
                oversized += 1;
                continue;
            }
            let days_ago = (now - item.entry.created_at) / (24 * 3600 * 1000);
            *per_day.entry(days_ago).or_default() += 1;

            // Seed the shared-store view so network re-adds dedup cleanly
            self.data_store.seed_local(item.entry.clone()).await;
            items.insert(item.uid().to_string(), item);
            loaded += 1;
        }
        drop(items);

        let mut histogram: Vec<(i64, usize)> = per_day.into_iter().collect();
        histogram.sort_by_key(|(days, _)| *days);
        info!(
            "Loaded {} mailbox item(s) (skipped {} expired, {} oversized); per-day: {:?}",
            loaded, expired, oversized, histogram
        );
        Ok(())
    }

    /// Wire up the data-store event loop and periodic maintenance.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut store_events = self.data_store.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = store_events.recv() => match event {
                        Ok(DataStoreEvent::Added(entries)) => {
                            this.on_entries_added(entries).await;
                        }
                        Ok(DataStoreEvent::Removed(ids)) => {
                            this.on_entries_removed(ids).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Mailbox lagged {} store event(s)", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = this.cancel.cancelled() => break,
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = this.data_store.purge_expired().await;
                        if purged > 0 {
                            debug!("Purged {} expired mailbox entries", purged);
                        }
                        let cutoff = chrono::Utc::now().timestamp_millis() - this.config.ttl_ms();
                        this.ignored.purge_older_than(cutoff);
                    }
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
    }

    /// Called once the initial data exchange finished. Only now do we
    /// start interpreting store content, and optionally begin the slow
    /// republish backstop.
    pub async fn set_bootstrapped(self: &Arc<Self>) {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return;
        }
        let backlog = self.data_store.snapshot().await;
        if !backlog.is_empty() {
            self.on_entries_added(backlog).await;
        }
        if self.config.republish_enabled {
            self.start_republish_task();
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Sending
    ///////////////////////////////////////////////////////////////////////

    /// Try direct delivery; fall back to the replicated store when the
    /// recipient is unreachable. Succeeds once the broadcast confirms
    /// storage, fails with a network-unavailable error when there are no
    /// connections at all.
    pub async fn send(
        &self,
        recipient: &PeerAddress,
        recipient_key: &[u8; 32],
        body: Vec<u8>,
    ) -> Result<SendOutcome, MailboxError> {
        if !self.is_bootstrapped() {
            return Err(MailboxError::NotBootstrapped);
        }
        if self.transport.connections().is_empty() {
            return Err(MailboxError::NetworkUnavailable);
        }
        let Some(local_address) = self.transport.local_address() else {
            return Err(MailboxError::NetworkUnavailable);
        };

        let message = MailboxMessage::new(local_address, body);
        let entry = MailboxEntry::seal(
            &self.keyring,
            recipient_key,
            &message,
            self.config.ttl_ms(),
        )?;

        if let Some(connection) = find_connection(&*self.transport, recipient) {
            // Our own connection knows the peer's capabilities; a peer that
            // advertised a set without Mailbox must not be sent one
            let capabilities = connection.capabilities();
            if !capabilities.is_empty() && !capabilities.contains(&Capability::Mailbox) {
                return Err(MailboxError::PeerLacksCapability);
            }
            match self
                .transport
                .send(&connection, NetworkMessage::MailboxDirect {
                    entry: entry.clone(),
                })
                .await
            {
                Ok(()) => return Ok(SendOutcome::Arrived),
                Err(e) => {
                    debug!("Direct delivery to {} failed: {}; using mailbox", recipient, e);
                }
            }
        }

        let operation = self
            .data_store
            .add(entry, None, true)
            .await
            .ok_or(MailboxError::AlreadyStored)?;
        let result = operation.wait().await;
        if result.completed > 0 {
            Ok(SendOutcome::StoredInMailbox)
        } else {
            Err(MailboxError::NotSufficientlyBroadcast {
                completed: result.completed,
                failed: result.failed,
            })
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Receiving
    ///////////////////////////////////////////////////////////////////////

    /// A sealed envelope delivered straight to us over a connection.
    pub async fn on_direct(self: &Arc<Self>, entry: MailboxEntry) {
        match entry.open(&self.keyring) {
            OpenOutcome::Message(message) => {
                let sender_key = entry.sender_key;
                self.handle_item(MailboxItem::mine(entry, message), sender_key, false)
                    .await;
            }
            OpenOutcome::NotAddressedToUs => {
                debug!("Direct envelope {} was not addressed to us", entry.id);
            }
            OpenOutcome::BadSignature | OpenOutcome::Malformed => {
                warn!("Discarding direct envelope {} with invalid content", entry.id);
            }
        }
    }

    /// New envelopes observed in the shared store. A single arrival is
    /// decrypted inline; batches are offloaded to a blocking worker and
    /// rejoined here before any state is touched.
    pub async fn on_entries_added(self: &Arc<Self>, entries: Vec<MailboxEntry>) {
        if let Some(local) = self.transport.local_address() {
            if self.peer_manager.is_seed(&local).await {
                // Seed nodes do not expect mailbox messages
                return;
            }
        }

        let to_try: Vec<MailboxEntry> = entries
            .into_iter()
            .filter(|entry| !self.ignored.is_ignored(&entry.id))
            .collect();
        if to_try.is_empty() {
            return;
        }

        let outcomes: Vec<(MailboxEntry, OpenOutcome)> = if to_try.len() == 1 {
            to_try
                .into_iter()
                .map(|entry| {
                    let outcome = entry.open(&self.keyring);
                    (entry, outcome)
                })
                .collect()
        } else {
            let keyring = self.keyring.clone();
            let started = std::time::Instant::now();
            let count = to_try.len();
            let result = tokio::task::spawn_blocking(move || {
                to_try
                    .into_iter()
                    .map(|entry| {
                        let outcome = entry.open(&keyring);
                        (entry, outcome)
                    })
                    .collect::<Vec<_>>()
            })
            .await;
            match result {
                Ok(outcomes) => {
                    debug!(
                        "Batch processing of {} mailbox entries took {} ms",
                        count,
                        started.elapsed().as_millis()
                    );
                    outcomes
                }
                Err(e) => {
                    warn!("Mailbox batch decryption worker failed: {}", e);
                    return;
                }
            }
        };

        for (entry, outcome) in outcomes {
            match outcome {
                OpenOutcome::Message(message) => {
                    let sender_key = entry.sender_key;
                    self.handle_item(MailboxItem::mine(entry, message), sender_key, true)
                        .await;
                }
                OpenOutcome::NotAddressedToUs => {
                    // Expected and frequent; remember so we never decrypt
                    // this envelope again, even across restarts
                    self.ignored.ignore(&entry.id, entry.created_at);
                }
                OpenOutcome::BadSignature => {
                    warn!("Discarding mailbox envelope {}: bad signature", entry.id);
                    self.ignored.ignore(&entry.id, entry.created_at);
                }
                OpenOutcome::Malformed => {
                    warn!("Discarding mailbox envelope {}: malformed payload", entry.id);
                    self.ignored.ignore(&entry.id, entry.created_at);
                }
            }
        }
    }

    /// Entries removed from the shared store by their publisher. Only
    /// foreign items key by the envelope id; our own are keyed by the
    /// decrypted message id and get removed on acknowledge.
    pub async fn on_entries_removed(&self, entry_ids: Vec<String>) {
        let removed: Vec<String> = {
            let mut items = self.items.write().await;
            entry_ids
                .into_iter()
                .filter(|id| items.remove(id).is_some())
                .collect()
        };
        for id in removed {
            let node_store = self.node_store.clone();
            let uid = id.clone();
            let result =
                tokio::task::spawn_blocking(move || node_store.remove_mailbox_item(&uid)).await;
            if let Ok(Err(e)) = result {
                debug!("Removing persisted mailbox item {} failed: {}", id, e);
            }
        }
    }

    async fn handle_item(
        self: &Arc<Self>,
        item: MailboxItem,
        sender_key: VerifyingKey,
        from_store: bool,
    ) {
        let uid = item.uid().to_string();
        let is_new = {
            let mut items = self.items.write().await;
            if items.contains_key(&uid) {
                false
            } else {
                items.insert(uid.clone(), item.clone());
                true
            }
        };
        if is_new {
            let node_store = self.node_store.clone();
            let persisted = item.clone();
            let save = tokio::task::spawn_blocking(move || {
                node_store.save_mailbox_item(&persisted)
            })
            .await;
            if let Ok(Err(e)) = save {
                warn!("Persisting mailbox item {} failed: {}", uid, e);
            }
        }

        // Apply to the domain even when the item was already known:
        // republished trade messages arrive as distinct envelopes with the
        // same content, and listeners dedup by message id.
        if let Some(message) = item.decrypted.clone() {
            info!(
                "Received mailbox message {} from {}",
                message.id, message.sender
            );
            let _ = self.events.send(MailboxEvent::MessageArrived {
                message,
                sender_key,
            });

            if from_store {
                if self.is_bootstrapped() {
                    // Clean the network right away; the local copy stays
                    // until the domain acknowledges it
                    self.data_store.remove(&item.entry.id, None, true).await;
                } else {
                    debug!("Not yet bootstrapped; network removal deferred to acknowledge");
                }
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Acknowledge
    ///////////////////////////////////////////////////////////////////////

    /// The domain processed a message: drop it locally and remove the
    /// backing entry from the shared store. Acknowledging twice is a no-op
    /// the second time. Before bootstrap completes the acknowledgement is
    /// deferred and retried rather than dropped.
    pub fn acknowledge(self: &Arc<Self>, message_id: &str) {
        if !self.is_bootstrapped() {
            let this = self.clone();
            let message_id = message_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(DEFERRED_ACK_DELAY) => this.acknowledge(&message_id),
                    _ = this.cancel.cancelled() => {}
                }
            });
            return;
        }

        let this = self.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            let removed = this.items.write().await.remove(&message_id);
            let Some(item) = removed else {
                debug!("Acknowledge for unknown message {}; no-op", message_id);
                return;
            };
            let node_store = this.node_store.clone();
            let uid = message_id.clone();
            let save =
                tokio::task::spawn_blocking(move || node_store.remove_mailbox_item(&uid)).await;
            if let Ok(Err(e)) = save {
                warn!("Removing persisted mailbox item failed: {}", e);
            }
            // Best effort: removing an already-removed entry is a no-op
            this.data_store.remove(&item.entry.id, None, true).await;
        });
    }

    ///////////////////////////////////////////////////////////////////////
    // Republish backstop
    ///////////////////////////////////////////////////////////////////////

    /// Slowly re-announce not-yet-expired items in small chunks with a
    /// cooldown in between, so the backstop never floods the network.
    fn start_republish_task(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let cooldown = Duration::from_secs(this.config.republish_cooldown_secs);
            let now = chrono::Utc::now().timestamp_millis();
            let entries: Vec<MailboxEntry> = this
                .items
                .read()
                .await
                .values()
                .filter(|item| !item.is_expired(now))
                .map(|item| item.entry.clone())
                .collect();
            info!("Republishing {} mailbox item(s) in chunks", entries.len());
            for chunk in entries.chunks(this.config.republish_chunk_size.max(1)) {
                for entry in chunk {
                    this.data_store.republish(entry.clone());
                }
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = this.cancel.cancelled() => return,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::network::broadcaster::Broadcaster;
    use crate::network::connection::Direction;
    use crate::network::testing::MockTransport;

    struct Setup {
        _dir: tempfile::TempDir,
        transport: Arc<MockTransport>,
        node_store: Arc<NodeStore>,
        service: Arc<MailboxService>,
        receiver_keyring: Arc<KeyRing>,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let node_store = Arc::new(NodeStore::open(dir.path()).unwrap());
        let transport = Arc::new(MockTransport::new());
        let peer_manager =
            PeerManager::new(transport.clone(), node_store.clone(), NetworkConfig::default());
        let broadcaster = Broadcaster::new(
            transport.clone(),
            Duration::from_millis(100),
            7,
            Duration::from_millis(1),
        );
        let data_store = DataStore::new(broadcaster);
        let keyring = Arc::new(node_store.load_or_create_keyring().unwrap());
        let service = MailboxService::new(
            transport.clone(),
            peer_manager,
            data_store,
            node_store.clone(),
            keyring.clone(),
            MailboxConfig::default(),
        );
        Setup {
            _dir: dir,
            transport,
            node_store,
            service,
            receiver_keyring: keyring,
        }
    }

    fn sealed_for(keyring: &KeyRing, body: &[u8]) -> (MailboxEntry, MailboxMessage) {
        let sender = KeyRing::generate();
        let message = MailboxMessage::new(PeerAddress::new("10.7.0.1", 7340), body.to_vec());
        let entry = MailboxEntry::seal(
            &sender,
            &keyring.exchange_public(),
            &message,
            15 * 24 * 3600 * 1000,
        )
        .unwrap();
        (entry, message)
    }

    #[tokio::test]
    async fn send_without_connections_is_network_unavailable() {
        let s = setup();
        s.service.set_bootstrapped().await;
        let result = s
            .service
            .send(
                &PeerAddress::new("10.7.0.9", 7340),
                &KeyRing::generate().exchange_public(),
                b"hi".to_vec(),
            )
            .await;
        assert!(matches!(result, Err(MailboxError::NetworkUnavailable)));
    }

    #[tokio::test]
    async fn send_before_bootstrap_is_rejected() {
        let s = setup();
        let result = s
            .service
            .send(
                &PeerAddress::new("10.7.0.9", 7340),
                &KeyRing::generate().exchange_public(),
                b"hi".to_vec(),
            )
            .await;
        assert!(matches!(result, Err(MailboxError::NotBootstrapped)));
    }

    #[tokio::test]
    async fn reachable_recipient_gets_direct_delivery() {
        let s = setup();
        s.service.set_bootstrapped().await;
        let recipient = PeerAddress::new("10.7.0.2", 7340);
        let connection = s
            .transport
            .add_connection(Some(recipient.clone()), Direction::Outbound);
        connection.apply_capabilities(&[Capability::Mailbox]);

        let outcome = s
            .service
            .send(
                &recipient,
                &KeyRing::generate().exchange_public(),
                b"direct".to_vec(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::Arrived);
        let sent = s.transport.sent();
        assert!(matches!(sent[0].1, NetworkMessage::MailboxDirect { .. }));
    }

    #[tokio::test]
    async fn unreachable_recipient_lands_in_the_replicated_store() {
        let s = setup();
        s.service.set_bootstrapped().await;
        // One relay connection with the mailbox capability, but not the
        // recipient itself
        let relay = s
            .transport
            .add_connection(Some(PeerAddress::new("10.7.0.3", 7340)), Direction::Outbound);
        relay.apply_capabilities(&[Capability::Mailbox]);

        let outcome = s
            .service
            .send(
                &PeerAddress::new("10.7.0.9", 7340),
                &KeyRing::generate().exchange_public(),
                b"offline".to_vec(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::StoredInMailbox);
        assert_eq!(s.service.data_store.len().await, 1);
        let sent = s.transport.sent();
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m, NetworkMessage::AddMailboxData { .. })));
    }

    #[tokio::test]
    async fn our_envelope_is_decrypted_and_announced() {
        let s = setup();
        s.service.set_bootstrapped().await;
        let mut events = s.service.subscribe();

        let (entry, message) = sealed_for(&s.receiver_keyring, b"for-us");
        s.service.on_entries_added(vec![entry]).await;

        match events.try_recv().unwrap() {
            MailboxEvent::MessageArrived { message: m, .. } => assert_eq!(m.id, message.id),
        }
        assert_eq!(s.service.item_count().await, 1);
        assert_eq!(s.service.my_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn foreign_envelope_is_ignored_exactly_once() {
        let s = setup();
        s.service.set_bootstrapped().await;
        let other = KeyRing::generate();
        let (entry, _) = sealed_for(&other, b"not-for-us");

        s.service.on_entries_added(vec![entry.clone()]).await;
        assert_eq!(s.service.item_count().await, 0);
        assert!(s.service.ignored.is_ignored(&entry.id));

        // A second observation is filtered before any decryption
        s.service.on_entries_added(vec![entry]).await;
        assert_eq!(s.service.item_count().await, 0);
    }

    #[tokio::test]
    async fn batch_arrival_is_processed_off_the_loop() {
        let s = setup();
        s.service.set_bootstrapped().await;
        let mut entries = Vec::new();
        for i in 0..5 {
            let (entry, _) = sealed_for(&s.receiver_keyring, format!("m{}", i).as_bytes());
            entries.push(entry);
        }
        let other = KeyRing::generate();
        let (foreign, _) = sealed_for(&other, b"alien");
        entries.push(foreign);

        s.service.on_entries_added(entries).await;
        assert_eq!(s.service.item_count().await, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acknowledging_twice_is_a_noop_the_second_time() {
        let s = setup();
        s.service.set_bootstrapped().await;
        let (entry, message) = sealed_for(&s.receiver_keyring, b"ackme");
        s.service.on_entries_added(vec![entry]).await;
        assert_eq!(s.service.item_count().await, 1);

        s.service.acknowledge(&message.id);
        // Give the spawned acknowledge a moment
        for _ in 0..50 {
            if s.service.item_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.service.item_count().await, 0);

        // Second acknowledge: nothing to remove, nothing blows up
        s.service.acknowledge(&message.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.service.item_count().await, 0);
    }

    #[tokio::test]
    async fn same_logical_message_in_two_envelopes_is_one_item() {
        let s = setup();
        s.service.set_bootstrapped().await;
        let mut events = s.service.subscribe();

        let sender = KeyRing::generate();
        let message = MailboxMessage::new(PeerAddress::new("10.7.0.1", 7340), b"dup".to_vec());
        let ttl = 15 * 24 * 3600 * 1000;
        let first =
            MailboxEntry::seal(&sender, &s.receiver_keyring.exchange_public(), &message, ttl)
                .unwrap();
        let second =
            MailboxEntry::seal(&sender, &s.receiver_keyring.exchange_public(), &message, ttl)
                .unwrap();
        assert_ne!(first.id, second.id);

        s.service.on_entries_added(vec![first]).await;
        s.service.on_entries_added(vec![second]).await;

        // One item, keyed by the message id; listeners were told twice and
        // dedup by that id
        assert_eq!(s.service.item_count().await, 1);
        let mut arrivals = 0;
        while let Ok(MailboxEvent::MessageArrived { message: m, .. }) = events.try_recv() {
            assert_eq!(m.id, message.id);
            arrivals += 1;
        }
        assert_eq!(arrivals, 2);
    }

    #[tokio::test]
    async fn expired_persisted_item_is_dropped_at_load() {
        let s = setup();
        // Persist an item that expired a day ago (TTL 15 days, created 16
        // days ago)
        let (mut entry, message) = sealed_for(&s.receiver_keyring, b"stale");
        entry.created_at = chrono::Utc::now().timestamp_millis() - 16 * 24 * 3600 * 1000;
        let item = MailboxItem::mine(entry, message);
        s.node_store.save_mailbox_item(&item).unwrap();

        s.service.load_persisted().await.unwrap();
        assert_eq!(s.service.item_count().await, 0);
        assert!(s.service.my_messages().await.is_empty());
    }

    #[tokio::test]
    async fn load_honors_cap_and_size_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let node_store = Arc::new(NodeStore::open(dir.path()).unwrap());
        let transport = Arc::new(MockTransport::new());
        let peer_manager =
            PeerManager::new(transport.clone(), node_store.clone(), NetworkConfig::default());
        let broadcaster = Broadcaster::new(
            transport.clone(),
            Duration::from_millis(100),
            7,
            Duration::from_millis(1),
        );
        let keyring = Arc::new(node_store.load_or_create_keyring().unwrap());
        let config = MailboxConfig {
            max_loaded_items: 3,
            max_entry_bytes: 1024,
            ..MailboxConfig::default()
        };
        let service = MailboxService::new(
            transport,
            peer_manager,
            DataStore::new(broadcaster),
            node_store.clone(),
            keyring.clone(),
            config,
        );

        for i in 0..5 {
            let (entry, message) = {
                let sender = KeyRing::generate();
                let message =
                    MailboxMessage::new(PeerAddress::new("10.7.0.1", 7340), vec![i as u8; 16]);
                let entry = MailboxEntry::seal(
                    &sender,
                    &keyring.exchange_public(),
                    &message,
                    15 * 24 * 3600 * 1000,
                )
                .unwrap();
                (entry, message)
            };
            node_store
                .save_mailbox_item(&MailboxItem::mine(entry, message))
                .unwrap();
        }
        // One oversized outlier
        let sender = KeyRing::generate();
        let big = MailboxMessage::new(PeerAddress::new("10.7.0.1", 7340), vec![0u8; 4096]);
        let big_entry = MailboxEntry::seal(
            &sender,
            &keyring.exchange_public(),
            &big,
            15 * 24 * 3600 * 1000,
        )
        .unwrap();
        node_store
            .save_mailbox_item(&MailboxItem::mine(big_entry, big))
            .unwrap();

        service.load_persisted().await.unwrap();
        assert_eq!(service.item_count().await, 3);
    }
}
