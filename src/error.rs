use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// Transient network faults. These are surfaced to callers as values
/// (or as fault notifications) and retried; they never escalate to a panic.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Send to {peer} failed: {reason}")]
    SendFailed { peer: String, reason: String },

    #[error("Send timed out after {0:?}")]
    SendTimeout(std::time::Duration),

    #[error("Connection to {0} is gone")]
    ConnectionGone(String),

    #[error("No connections available")]
    NotConnected,

    #[error("Peer lacks required capability: {0}")]
    MissingCapability(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol version mismatch: ours={ours}, theirs={theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt identity key material")]
    CorruptIdentity,
}

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("Network is not bootstrapped yet")]
    NotBootstrapped,

    #[error("No P2P network connections available")]
    NetworkUnavailable,

    #[error("Sealing failed: {0}")]
    Seal(String),

    #[error("Envelope signature invalid")]
    BadSignature,

    #[error("Message was not sufficiently broadcast: completed={completed}, failed={failed}")]
    NotSufficientlyBroadcast { completed: usize, failed: usize },

    #[error("Entry already exists in the local data store")]
    AlreadyStored,

    #[error("Peer does not support the mailbox capability")]
    PeerLacksCapability,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
