//! The local view of the shared replicated mailbox store.
//!
//! An id-keyed map of sealed entries with add/remove notifications.
//! Adding or removing an entry publishes the change to the network via the
//! broadcast coordinator; entries arriving from the network are relayed
//! with a capped fan-out. Add and remove are idempotent so republished
//! content and duplicate removals are harmless.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::mailbox::envelope::MailboxEntry;
use crate::network::broadcaster::{BroadcastOperation, Broadcaster};
use crate::network::message::NetworkMessage;
use crate::network::peer::PeerAddress;

#[derive(Clone, Debug)]
pub enum DataStoreEvent {
    Added(Vec<MailboxEntry>),
    Removed(Vec<String>),
}

pub struct DataStore {
    broadcaster: Arc<Broadcaster>,
    entries: RwLock<HashMap<String, MailboxEntry>>,
    events: broadcast::Sender<DataStoreEvent>,
}

impl DataStore {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            broadcaster,
            entries: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataStoreEvent> {
        self.events.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, entry_id: &str) -> bool {
        self.entries.read().await.contains_key(entry_id)
    }

    pub async fn snapshot(&self) -> Vec<MailboxEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Insert an entry and publish it. `from` excludes the connection the
    /// entry arrived on when relaying; `is_data_owner` distinguishes our
    /// own publications from relays (which get the capped fan-out).
    /// Returns None when the entry was already present or expired.
    pub async fn add(
        self: &Arc<Self>,
        entry: MailboxEntry,
        from: Option<&PeerAddress>,
        is_data_owner: bool,
    ) -> Option<Arc<BroadcastOperation>> {
        let now = chrono::Utc::now().timestamp_millis();
        if entry.is_expired(now) {
            debug!("Dropping expired mailbox entry {}", entry.id);
            return None;
        }
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&entry.id) {
                return None;
            }
            entries.insert(entry.id.clone(), entry.clone());
        }

        let _ = self.events.send(DataStoreEvent::Added(vec![entry.clone()]));
        let operation =
            self.broadcaster
                .broadcast(NetworkMessage::AddMailboxData { entry }, from, is_data_owner);
        Some(operation)
    }

    /// Insert without publishing, for persisted items reloaded at startup.
    pub async fn seed_local(&self, entry: MailboxEntry) {
        self.entries
            .write()
            .await
            .entry(entry.id.clone())
            .or_insert(entry);
    }

    /// Re-announce an entry that is already in the map (resilience
    /// backstop). No event, no insertion.
    pub fn republish(self: &Arc<Self>, entry: MailboxEntry) {
        self.broadcaster
            .broadcast(NetworkMessage::AddMailboxData { entry }, None, true);
    }

    /// Remove an entry and publish the removal. Removing an entry that is
    /// already gone is a no-op, never an error.
    pub async fn remove(
        self: &Arc<Self>,
        entry_id: &str,
        from: Option<&PeerAddress>,
        is_data_owner: bool,
    ) -> bool {
        let removed = self.entries.write().await.remove(entry_id).is_some();
        if !removed {
            debug!("Mailbox entry {} was already removed", entry_id);
            return false;
        }
        let _ = self
            .events
            .send(DataStoreEvent::Removed(vec![entry_id.to_string()]));
        self.broadcaster.broadcast(
            NetworkMessage::RemoveMailboxData {
                entry_id: entry_id.to_string(),
            },
            from,
            is_data_owner,
        );
        true
    }

    /// Network handlers: entries and removals observed from peers are
    /// applied and relayed onward.
    pub async fn on_add_from_network(self: &Arc<Self>, entry: MailboxEntry, from: &PeerAddress) {
        self.add(entry, Some(from), false).await;
    }

    pub async fn on_remove_from_network(self: &Arc<Self>, entry_id: &str, from: &PeerAddress) {
        self.remove(entry_id, Some(from), false).await;
    }

    /// Drop expired entries locally. Their publishers stopped refreshing
    /// them; no removal is broadcast.
    pub async fn purge_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::envelope::{KeyRing, MailboxMessage};
    use crate::network::testing::MockTransport;
    use std::time::Duration;

    const DAY_MS: i64 = 24 * 3600 * 1000;

    fn data_store() -> (Arc<MockTransport>, Arc<DataStore>) {
        let transport = Arc::new(MockTransport::new());
        let broadcaster = Broadcaster::new(
            transport.clone(),
            Duration::from_millis(100),
            7,
            Duration::from_millis(1),
        );
        (transport, DataStore::new(broadcaster))
    }

    fn entry() -> MailboxEntry {
        let sender = KeyRing::generate();
        let receiver = KeyRing::generate();
        let message = MailboxMessage::new(
            crate::network::peer::PeerAddress::new("10.6.0.1", 7340),
            b"payload".to_vec(),
        );
        MailboxEntry::seal(&sender, &receiver.exchange_public(), &message, 15 * DAY_MS).unwrap()
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let (_transport, store) = data_store();
        let e = entry();

        assert!(store.add(e.clone(), None, true).await.is_some());
        assert!(store.add(e, None, true).await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn remove_twice_is_a_noop_the_second_time() {
        let (_transport, store) = data_store();
        let e = entry();
        let id = e.id.clone();
        store.add(e, None, true).await;

        assert!(store.remove(&id, None, true).await);
        assert!(!store.remove(&id, None, true).await);
    }

    #[tokio::test]
    async fn expired_entries_are_not_accepted_and_are_purged() {
        let (_transport, store) = data_store();
        let mut e = entry();
        e.created_at -= 16 * DAY_MS;

        assert!(store.add(e, None, true).await.is_none());
        assert_eq!(store.len().await, 0);

        let mut stale = entry();
        store.add(stale.clone(), None, true).await;
        // Expire it in place
        stale.created_at -= 16 * DAY_MS;
        store.entries.write().await.insert(stale.id.clone(), stale);
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn add_publishes_and_notifies() {
        let (transport, store) = data_store();
        transport.add_connection(
            Some(crate::network::peer::PeerAddress::new("10.6.0.2", 7340)),
            crate::network::connection::Direction::Outbound,
        );
        let mut events = store.subscribe();

        let operation = store.add(entry(), None, true).await.unwrap();
        // Capability gating: the connection never advertised Mailbox
        assert_eq!(operation.num_targets(), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            DataStoreEvent::Added(_)
        ));
    }
}
