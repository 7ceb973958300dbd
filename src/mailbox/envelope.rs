//! Sealed mailbox envelopes and the node key ring.
//!
//! An envelope is sealed for exactly one receiver: X25519 ECDH between a
//! fresh ephemeral key and the receiver's static key, an HMAC-SHA256 key
//! derivation, AES-256-GCM for the payload, and an Ed25519 signature
//! binding the whole envelope to the sender key. A failed decryption is
//! the normal outcome for every envelope not addressed to us.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::MailboxError;
use crate::network::peer::PeerAddress;

type HmacSha256 = Hmac<Sha256>;

/// Node identity: an Ed25519 signing key and a static X25519 exchange key.
/// Both are zeroized on drop by their dalek implementations.
pub struct KeyRing {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl KeyRing {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            exchange: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(signing: &[u8; 32], exchange: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(signing),
            exchange: StaticSecret::from(*exchange),
        }
    }

    pub fn to_bytes(&self) -> ([u8; 32], [u8; 32]) {
        (self.signing.to_bytes(), self.exchange.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The public half peers seal mailbox messages to
    pub fn exchange_public(&self) -> [u8; 32] {
        PublicKey::from(&self.exchange).to_bytes()
    }
}

/// The plaintext carried inside a sealed envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    /// Stable id; the dedup key for user-visible effects
    pub id: String,
    pub sender: PeerAddress,
    pub body: Vec<u8>,
}

impl MailboxMessage {
    pub fn new(sender: PeerAddress, body: Vec<u8>) -> Self {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut hasher = blake3::Hasher::new();
        hasher.update(sender.to_string().as_bytes());
        hasher.update(&body);
        hasher.update(&salt);
        let id = hex::encode(&hasher.finalize().as_bytes()[..16]);
        Self { id, sender, body }
    }
}

/// An encrypted envelope plus its storage metadata, as replicated through
/// the shared data store and persisted locally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailboxEntry {
    /// Envelope id, distinct from the id of the sealed message
    pub id: String,
    /// Sender's Ed25519 key the signature verifies against
    pub sender_key: VerifyingKey,
    /// Ephemeral X25519 public key of this sealing
    pub ephemeral_key: [u8; 32],
    /// Receiver's static X25519 public key (storage addressing)
    pub receiver_key: [u8; 32],
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub signature: Signature,
    /// Unix millis
    pub created_at: i64,
    pub ttl_ms: i64,
}

/// Result of attempting to open a sealed envelope.
#[derive(Debug)]
pub enum OpenOutcome {
    /// Addressed to us; decrypted and signature-verified
    Message(MailboxMessage),
    /// The expected, frequent case: sealed for someone else
    NotAddressedToUs,
    /// Decrypted fine but the signature does not verify; discard
    BadSignature,
    /// Decrypted fine but the plaintext does not parse; discard
    Malformed,
}

impl MailboxEntry {
    /// Seal `message` for the holder of `receiver_key`.
    pub fn seal(
        keyring: &KeyRing,
        receiver_key: &[u8; 32],
        message: &MailboxMessage,
        ttl_ms: i64,
    ) -> Result<Self, MailboxError> {
        let plaintext =
            bincode::serialize(message).map_err(|e| MailboxError::Seal(e.to_string()))?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*receiver_key));
        let key = derive_key(shared.as_bytes(), &ephemeral_public, receiver_key);

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| MailboxError::Seal("encryption failed".to_string()))?;

        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let id = hex::encode(id_bytes);
        let created_at = chrono::Utc::now().timestamp_millis();

        let signed = signed_payload(
            &id,
            &ephemeral_public,
            receiver_key,
            &nonce,
            &ciphertext,
            created_at,
            ttl_ms,
        );
        let signature = keyring.signing.sign(&signed);

        Ok(Self {
            id,
            sender_key: keyring.verifying_key(),
            ephemeral_key: ephemeral_public,
            receiver_key: *receiver_key,
            nonce,
            ciphertext,
            signature,
            created_at,
            ttl_ms,
        })
    }

    /// Try to open the envelope with our own exchange key.
    pub fn open(&self, keyring: &KeyRing) -> OpenOutcome {
        let shared = keyring
            .exchange
            .diffie_hellman(&PublicKey::from(self.ephemeral_key));
        let key = derive_key(shared.as_bytes(), &self.ephemeral_key, &self.receiver_key);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = match cipher.decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice()) {
            Ok(p) => p,
            // Not sealed for our key; never an error
            Err(_) => return OpenOutcome::NotAddressedToUs,
        };

        let signed = signed_payload(
            &self.id,
            &self.ephemeral_key,
            &self.receiver_key,
            &self.nonce,
            &self.ciphertext,
            self.created_at,
            self.ttl_ms,
        );
        if self.sender_key.verify(&signed, &self.signature).is_err() {
            return OpenOutcome::BadSignature;
        }

        match bincode::deserialize::<MailboxMessage>(&plaintext) {
            Ok(message) => OpenOutcome::Message(message),
            Err(_) => OpenOutcome::Malformed,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.created_at > self.ttl_ms
    }

    /// Serialized size, the load-time cutoff input
    pub fn approximate_size(&self) -> usize {
        // Fixed fields are small; the ciphertext dominates
        self.ciphertext.len() + 192
    }
}

fn derive_key(shared: &[u8], ephemeral_public: &[u8; 32], receiver_key: &[u8; 32]) -> [u8; 32] {
    // HMAC-SHA256(shared, eph_pub || receiver_pub) as a fixed-size KDF
    let mut mac = <HmacSha256 as Mac>::new_from_slice(shared).expect("HMAC accepts any key length");
    mac.update(ephemeral_public);
    mac.update(receiver_key);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    key.copy_from_slice(&out);
    key
}

fn signed_payload(
    id: &str,
    ephemeral_key: &[u8; 32],
    receiver_key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    created_at: i64,
    ttl_ms: i64,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(id.len() + 96 + ciphertext.len());
    data.extend_from_slice(id.as_bytes());
    data.extend_from_slice(ephemeral_key);
    data.extend_from_slice(receiver_key);
    data.extend_from_slice(nonce);
    data.extend_from_slice(ciphertext);
    data.extend_from_slice(&created_at.to_le_bytes());
    data.extend_from_slice(&ttl_ms.to_le_bytes());
    data
}

/// A stored envelope together with the decrypted message when it turned
/// out to be addressed to this node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailboxItem {
    pub entry: MailboxEntry,
    pub decrypted: Option<MailboxMessage>,
}

impl MailboxItem {
    pub fn foreign(entry: MailboxEntry) -> Self {
        Self {
            entry,
            decrypted: None,
        }
    }

    pub fn mine(entry: MailboxEntry, message: MailboxMessage) -> Self {
        Self {
            entry,
            decrypted: Some(message),
        }
    }

    pub fn is_mine(&self) -> bool {
        self.decrypted.is_some()
    }

    /// The id of the decrypted message when we could read it, otherwise
    /// the envelope's own id.
    pub fn uid(&self) -> &str {
        self.decrypted
            .as_ref()
            .map(|m| m.id.as_str())
            .unwrap_or(self.entry.id.as_str())
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.entry.is_expired(now_ms)
    }
}
