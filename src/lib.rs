//! swarmd — the peer-to-peer resilience layer of a decentralized trading
//! network.
//!
//! Keeps a node's view of the swarm consistent despite churn (peer
//! manager), propagates data without a central broadcaster (broadcast
//! coordinator), lets independent nodes detect silently-diverging local
//! state (state hash chain monitor), and delivers encrypted messages to
//! recipients that are currently offline (mailbox store).
//!
//! The transport and the state-computation engine are external
//! collaborators behind the [`network::connection::Transport`] and
//! [`monitor::service::EpochSource`] traits.

pub mod clock;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod monitor;
pub mod network;
pub mod node;
pub mod storage;
