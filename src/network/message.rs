use serde::{Deserialize, Serialize};

use crate::mailbox::envelope::MailboxEntry;
use crate::monitor::hash::{StateHash, StreamId};
use crate::network::peer::{Capability, Peer, PeerAddress};

/// Bumped on incompatible wire changes; carried in every frame.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum NetworkMessage {
    // First message after connecting
    Handshake {
        protocol_version: u32,
        network: String,
        listen_addr: Option<PeerAddress>,
        capabilities: Vec<Capability>,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    // Peer exchange
    GetPeers {
        nonce: u64,
    },
    Peers {
        peers: Vec<Peer>,
        nonce: u64,
    },
    // State hash chain monitoring
    GetStateHashes {
        stream: StreamId,
        from_height: u64,
        nonce: u64,
    },
    StateHashes {
        stream: StreamId,
        hashes: Vec<StateHash>,
        nonce: u64,
    },
    NewStateHash {
        stream: StreamId,
        hash: StateHash,
    },
    // Shared replicated mailbox store
    AddMailboxData {
        entry: MailboxEntry,
    },
    RemoveMailboxData {
        entry_id: String,
    },
    // Direct delivery of a sealed envelope to a reachable recipient
    MailboxDirect {
        entry: MailboxEntry,
    },
}

impl NetworkMessage {
    /// Capability the receiving peer must advertise before this message
    /// may be sent to it.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            NetworkMessage::GetPeers { .. } | NetworkMessage::Peers { .. } => {
                Some(Capability::PeerExchange)
            }
            NetworkMessage::GetStateHashes { .. }
            | NetworkMessage::StateHashes { .. }
            | NetworkMessage::NewStateHash { .. } => Some(Capability::StateMonitor),
            NetworkMessage::AddMailboxData { .. }
            | NetworkMessage::RemoveMailboxData { .. }
            | NetworkMessage::MailboxDirect { .. } => Some(Capability::Mailbox),
            _ => None,
        }
    }

    /// Short name for logs
    pub fn type_name(&self) -> &'static str {
        match self {
            NetworkMessage::Handshake { .. } => "Handshake",
            NetworkMessage::Ping { .. } => "Ping",
            NetworkMessage::Pong { .. } => "Pong",
            NetworkMessage::GetPeers { .. } => "GetPeers",
            NetworkMessage::Peers { .. } => "Peers",
            NetworkMessage::GetStateHashes { .. } => "GetStateHashes",
            NetworkMessage::StateHashes { .. } => "StateHashes",
            NetworkMessage::NewStateHash { .. } => "NewStateHash",
            NetworkMessage::AddMailboxData { .. } => "AddMailboxData",
            NetworkMessage::RemoveMailboxData { .. } => "RemoveMailboxData",
            NetworkMessage::MailboxDirect { .. } => "MailboxDirect",
        }
    }
}
