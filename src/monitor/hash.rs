//! State hash chain building blocks.
//!
//! Each epoch's digest covers the previous digest, so a single matching
//! digest at the tip proves the whole history matches.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

pub const STATE_HASH_LEN: usize = 20;

/// One monitored state stream. The monitor is generic; the daemon runs one
/// instance per stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamId {
    /// Settled ledger state
    Ledger,
    /// Open offer book
    Offers,
    /// Governance votes
    Votes,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Ledger => write!(f, "ledger"),
            StreamId::Offers => write!(f, "offers"),
            StreamId::Votes => write!(f, "votes"),
        }
    }
}

/// Rolling digest of the locally computed state at one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHash {
    pub height: u64,
    pub hash: [u8; STATE_HASH_LEN],
    pub item_count: u64,
}

impl StateHash {
    pub fn new(height: u64, hash: [u8; STATE_HASH_LEN], item_count: u64) -> Self {
        Self {
            height,
            hash,
            item_count,
        }
    }

    pub fn has_equal_hash(&self, other: &StateHash) -> bool {
        self.hash == other.hash
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateHash(height={}, hash={}, items={})",
            self.height,
            hex::encode(self.hash),
            self.item_count
        )
    }
}

/// `digest = SHA-256(previous digest ∥ serialized epoch items)`, truncated
/// to 20 bytes. The genesis epoch uses an empty previous digest.
pub fn compute_digest(
    previous: Option<&[u8; STATE_HASH_LEN]>,
    serialized_items: &[u8],
) -> [u8; STATE_HASH_LEN] {
    let mut hasher = Sha256::new();
    if let Some(prev) = previous {
        hasher.update(prev);
    }
    hasher.update(serialized_items);
    let full = hasher.finalize();
    let mut digest = [0u8; STATE_HASH_LEN];
    digest.copy_from_slice(&full[..STATE_HASH_LEN]);
    digest
}

/// One chain entry: our own hash for an epoch plus every peer-reported hash
/// for the same epoch, and the subset that conflicts with ours.
#[derive(Clone, Debug)]
pub struct StateBlock {
    pub my_hash: StateHash,
    /// Peer identity -> that peer's reported hash for this height
    pub peer_hashes: HashMap<String, StateHash>,
    /// Peers whose hash differs from ours
    pub conflicts: HashMap<String, StateHash>,
}

impl StateBlock {
    pub fn new(my_hash: StateHash) -> Self {
        Self {
            my_hash,
            peer_hashes: HashMap::new(),
            conflicts: HashMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.my_hash.height
    }

    /// Record a peer's hash for this height. Returns true when the hash
    /// conflicts with our own.
    pub fn put_peer_hash(&mut self, peer: String, hash: StateHash) -> bool {
        let conflict = !self.my_hash.has_equal_hash(&hash);
        if conflict {
            self.conflicts.insert(peer.clone(), hash.clone());
        }
        self.peer_hashes.insert(peer, hash);
        conflict
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_prev_linked() {
        let genesis = compute_digest(None, b"epoch-0-items");
        let next = compute_digest(Some(&genesis), b"epoch-1-items");
        // Same items on a different previous digest give a different hash
        let other_prev = compute_digest(None, b"different-genesis");
        let diverged = compute_digest(Some(&other_prev), b"epoch-1-items");
        assert_ne!(next, diverged);
        // Deterministic
        assert_eq!(next, compute_digest(Some(&genesis), b"epoch-1-items"));
    }

    #[test]
    fn peer_hash_conflict_tracking() {
        let digest = compute_digest(None, b"items");
        let mine = StateHash::new(7, digest, 3);
        let mut block = StateBlock::new(mine.clone());

        assert!(!block.put_peer_hash("10.0.0.2:7340".to_string(), mine.clone()));
        assert!(!block.has_conflicts());

        let theirs = StateHash::new(7, compute_digest(None, b"other"), 3);
        assert!(block.put_peer_hash("10.0.0.3:7340".to_string(), theirs));
        assert!(block.has_conflicts());
        assert_eq!(block.peer_hashes.len(), 2);
        assert_eq!(block.conflicts.len(), 1);
    }
}
