//! Failed-decryption records.
//!
//! Decryption is by far the most expensive step of mailbox processing and
//! fails for every envelope not addressed to us. Each failed envelope id
//! is recorded here, persisted across restarts, and never tried again.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::storage::NodeStore;

const CACHE_CAPACITY: usize = 4096;

pub struct IgnoredMailbox {
    store: Arc<NodeStore>,
    /// Hot front for the sled tree
    cache: Mutex<LruCache<String, i64>>,
}

impl IgnoredMailbox {
    pub fn new(store: Arc<NodeStore>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn is_ignored(&self, entry_id: &str) -> bool {
        if self.cache.lock().get(entry_id).is_some() {
            return true;
        }
        match self.store.ignored_contains(entry_id) {
            Ok(true) => {
                self.cache.lock().put(entry_id.to_string(), 0);
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("Ignored-mailbox lookup failed: {}", e);
                false
            }
        }
    }

    pub fn ignore(&self, entry_id: &str, created_at: i64) {
        self.cache.lock().put(entry_id.to_string(), created_at);
        if let Err(e) = self.store.ignored_insert(entry_id, created_at) {
            debug!("Persisting ignored-mailbox record failed: {}", e);
        }
    }

    /// Drop records older than the mailbox TTL. The envelopes they belong
    /// to have expired, so the ids can never be observed again.
    pub fn purge_older_than(&self, cutoff_ms: i64) {
        match self.store.ignored_purge_before(cutoff_ms) {
            Ok(purged) if purged > 0 => {
                debug!("Purged {} ignored-mailbox record(s)", purged);
                self.cache.lock().clear();
            }
            Ok(_) => {}
            Err(e) => debug!("Purging ignored-mailbox records failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_survives_a_cold_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::open(dir.path()).unwrap());

        let first = IgnoredMailbox::new(store.clone());
        first.ignore("envelope-1", 1000);
        drop(first);

        // Fresh instance: cache empty, sled still knows
        let second = IgnoredMailbox::new(store);
        assert!(second.is_ignored("envelope-1"));
        assert!(!second.is_ignored("envelope-2"));
    }

    #[test]
    fn purge_removes_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::open(dir.path()).unwrap());
        let ignored = IgnoredMailbox::new(store);

        ignored.ignore("old", 1_000);
        ignored.ignore("fresh", 5_000);
        ignored.purge_older_than(2_000);

        assert!(!ignored.is_ignored("old"));
        assert!(ignored.is_ignored("fresh"));
    }
}
