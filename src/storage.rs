//! Sled-backed node store.
//!
//! Everything that must survive a restart lives here: the bounded
//! persisted peer list, the bounded mailbox item list, the ignored-mailbox
//! records and the node identity keys. All values are bincode and all
//! trees are keyed so reloads are idempotent.

use std::path::Path;
use zeroize::Zeroizing;

use crate::error::StorageError;
use crate::mailbox::envelope::{KeyRing, MailboxItem};
use crate::network::peer::Peer;

const PEERS_TREE: &str = "peers";
const MAILBOX_TREE: &str = "mailbox";
const IGNORED_TREE: &str = "mailbox_ignored";
const IDENTITY_TREE: &str = "identity";

pub struct NodeStore {
    db: sled::Db,
}

impl NodeStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|source| StorageError::DatabaseOpen {
            name: path.display().to_string(),
            source,
        })?;
        Ok(Self { db })
    }

    /// Load the node key ring, generating and persisting one on first run.
    /// Raw key bytes are wiped from memory once the ring is constructed.
    pub fn load_or_create_keyring(&self) -> Result<KeyRing, StorageError> {
        let tree = self.db.open_tree(IDENTITY_TREE)?;
        match (tree.get(b"signing")?, tree.get(b"exchange")?) {
            (Some(signing), Some(exchange)) => {
                let signing: Zeroizing<[u8; 32]> = Zeroizing::new(
                    signing
                        .as_ref()
                        .try_into()
                        .map_err(|_| StorageError::CorruptIdentity)?,
                );
                let exchange: Zeroizing<[u8; 32]> = Zeroizing::new(
                    exchange
                        .as_ref()
                        .try_into()
                        .map_err(|_| StorageError::CorruptIdentity)?,
                );
                Ok(KeyRing::from_bytes(&signing, &exchange))
            }
            _ => {
                let keyring = KeyRing::generate();
                let (signing, exchange) = keyring.to_bytes();
                let signing = Zeroizing::new(signing);
                let exchange = Zeroizing::new(exchange);
                tree.insert(b"signing", signing.as_slice())?;
                tree.insert(b"exchange", exchange.as_slice())?;
                self.db.flush()?;
                tracing::info!("Generated new node identity keys");
                Ok(keyring)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Peers
    ///////////////////////////////////////////////////////////////////////

    /// Replace the persisted peer list with a size-bounded snapshot.
    pub fn save_peers(&self, peers: &[Peer], cap: usize) -> Result<(), StorageError> {
        let tree = self.db.open_tree(PEERS_TREE)?;
        tree.clear()?;
        for peer in peers.iter().take(cap) {
            let key = peer.address.to_string();
            let value = bincode::serialize(peer)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            tree.insert(key.as_bytes(), value)?;
        }
        self.db.flush()?;
        Ok(())
    }

    pub fn load_peers(&self) -> Result<Vec<Peer>, StorageError> {
        let tree = self.db.open_tree(PEERS_TREE)?;
        let mut peers = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match bincode::deserialize::<Peer>(&value) {
                Ok(peer) => peers.push(peer),
                Err(e) => tracing::warn!("Skipping corrupt persisted peer record: {}", e),
            }
        }
        Ok(peers)
    }

    ///////////////////////////////////////////////////////////////////////
    // Mailbox items
    ///////////////////////////////////////////////////////////////////////

    pub fn save_mailbox_item(&self, item: &MailboxItem) -> Result<(), StorageError> {
        let tree = self.db.open_tree(MAILBOX_TREE)?;
        let value =
            bincode::serialize(item).map_err(|e| StorageError::Serialization(e.to_string()))?;
        tree.insert(item.uid().as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn remove_mailbox_item(&self, uid: &str) -> Result<(), StorageError> {
        let tree = self.db.open_tree(MAILBOX_TREE)?;
        tree.remove(uid.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// All persisted items, unsorted; the mailbox service applies its
    /// newest-first cap and expiry/size filters.
    pub fn load_mailbox_items(&self) -> Result<Vec<MailboxItem>, StorageError> {
        let tree = self.db.open_tree(MAILBOX_TREE)?;
        let mut items = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match bincode::deserialize::<MailboxItem>(&value) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!("Skipping corrupt persisted mailbox item: {}", e),
            }
        }
        Ok(items)
    }

    ///////////////////////////////////////////////////////////////////////
    // Ignored mailbox records (failed decryptions, never retried)
    ///////////////////////////////////////////////////////////////////////

    pub fn ignored_insert(&self, entry_id: &str, created_at: i64) -> Result<(), StorageError> {
        let tree = self.db.open_tree(IGNORED_TREE)?;
        tree.insert(entry_id.as_bytes(), &created_at.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn ignored_contains(&self, entry_id: &str) -> Result<bool, StorageError> {
        let tree = self.db.open_tree(IGNORED_TREE)?;
        Ok(tree.contains_key(entry_id.as_bytes())?)
    }

    /// Drop records whose creation timestamp lies before the cutoff.
    /// Returns the number purged.
    pub fn ignored_purge_before(&self, cutoff_ms: i64) -> Result<usize, StorageError> {
        let tree = self.db.open_tree(IGNORED_TREE)?;
        let mut stale = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let created_at = value
                .as_ref()
                .try_into()
                .map(i64::from_be_bytes)
                .unwrap_or(0);
            if created_at < cutoff_ms {
                stale.push(key);
            }
        }
        let purged = stale.len();
        for key in stale {
            tree.remove(key)?;
        }
        Ok(purged)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::PeerAddress;

    fn temp_store() -> (tempfile::TempDir, NodeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn keyring_is_stable_across_loads() {
        let (_dir, store) = temp_store();
        let first = store.load_or_create_keyring().unwrap();
        let second = store.load_or_create_keyring().unwrap();
        assert_eq!(first.exchange_public(), second.exchange_public());
        assert_eq!(first.verifying_key(), second.verifying_key());
    }

    #[test]
    fn peers_roundtrip_is_capped() {
        let (_dir, store) = temp_store();
        let peers: Vec<Peer> = (0..10)
            .map(|i| Peer::new(PeerAddress::new(format!("10.0.0.{}", i), 7340)))
            .collect();
        store.save_peers(&peers, 4).unwrap();
        assert_eq!(store.load_peers().unwrap().len(), 4);
    }

    #[test]
    fn ignored_records_purge_by_age() {
        let (_dir, store) = temp_store();
        store.ignored_insert("old", 1_000).unwrap();
        store.ignored_insert("new", 2_000).unwrap();
        assert!(store.ignored_contains("old").unwrap());

        let purged = store.ignored_purge_before(1_500).unwrap();
        assert_eq!(purged, 1);
        assert!(!store.ignored_contains("old").unwrap());
        assert!(store.ignored_contains("new").unwrap());
    }
}
