//! Peer-list gossip.
//!
//! Periodically asks a few random connected peers for their live peers and
//! merges the answers into the peer manager's pools. After a total
//! connection loss or a standby wake-up the next request is scheduled much
//! sooner, so the node repopulates its view quickly.

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::network::connection::{Connection, Transport};
use crate::network::message::NetworkMessage;
use crate::network::peer_manager::{ConnectivityEvent, PeerManager};

const REQUEST_INTERVAL: Duration = Duration::from_secs(10 * 60);
const RETRY_AFTER_LOSS: Duration = Duration::from_secs(3);
/// How many peers to ask per round
const REQUEST_FAN_OUT: usize = 3;
/// Cap on the peers we put into one response
const MAX_PEERS_IN_RESPONSE: usize = 200;

pub struct PeerExchange {
    transport: Arc<dyn Transport>,
    peer_manager: Arc<PeerManager>,
    cancel: CancellationToken,
}

impl PeerExchange {
    pub fn new(transport: Arc<dyn Transport>, peer_manager: Arc<PeerManager>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            peer_manager,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the periodic exchange and the connectivity-loss fast path.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut connectivity = self.peer_manager.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REQUEST_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.request_from_random_peers().await;
                    }
                    event = connectivity.recv() => match event {
                        Ok(ConnectivityEvent::NewConnectionAfterAllLost)
                        | Ok(ConnectivityEvent::AwakeFromStandby) => {
                            tokio::time::sleep(RETRY_AFTER_LOSS).await;
                            this.request_from_random_peers().await;
                        }
                        Ok(ConnectivityEvent::AllConnectionsLost) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
    }

    pub async fn request_from_random_peers(&self) {
        let mut connections = self.transport.connections();
        connections.retain(|c| c.has_peer_address());
        if connections.is_empty() {
            debug!("No connections for peer exchange");
            return;
        }
        connections.shuffle(&mut rand::thread_rng());
        for connection in connections.into_iter().take(REQUEST_FAN_OUT) {
            let nonce = rand::thread_rng().gen();
            if let Err(e) = self
                .transport
                .send(&connection, NetworkMessage::GetPeers { nonce })
                .await
            {
                debug!(
                    "Peer exchange request to {:?} failed: {}",
                    connection.peer_address(),
                    e
                );
            }
        }
    }

    /// Answer a GetPeers request with our live and reported peers, capped.
    pub async fn on_get_peers(&self, connection: &Arc<Connection>, nonce: u64) {
        let exclude = connection.peer_address();
        let mut peers = self.peer_manager.get_live_peers(exclude.as_ref()).await;
        for peer in self.peer_manager.reported_peers().await {
            if peers.len() >= MAX_PEERS_IN_RESPONSE {
                break;
            }
            if Some(&peer.address) != exclude.as_ref() && !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        peers.truncate(MAX_PEERS_IN_RESPONSE);

        debug!(
            "Answering GetPeers from {:?} with {} peer(s)",
            exclude,
            peers.len()
        );
        if let Err(e) = self
            .transport
            .send(connection, NetworkMessage::Peers { peers, nonce })
            .await
        {
            debug!("Sending peers response failed: {}", e);
        }
    }

    /// Merge a Peers response into the pools.
    pub async fn on_peers(&self, connection: &Arc<Connection>, peers: Vec<crate::network::peer::Peer>) {
        info!(
            "Received {} peer(s) from {:?}",
            peers.len(),
            connection.peer_address()
        );
        self.peer_manager.add_reported_peers(peers, connection).await;
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
    use crate::network::peer::{Peer, PeerAddress};
    use crate::network::testing::MockTransport;
    use crate::storage::NodeStore;

    fn setup() -> (tempfile::TempDir, Arc<MockTransport>, Arc<PeerExchange>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NodeStore::open(dir.path()).unwrap());
        let transport = Arc::new(MockTransport::new());
        let manager = PeerManager::new(transport.clone(), store, NetworkConfig::default());
        let exchange = PeerExchange::new(transport.clone(), manager);
        (dir, transport, exchange)
    }

    #[tokio::test]
    async fn get_peers_is_answered_with_capped_list() {
        let (_dir, transport, exchange) = setup();
        let requester =
            transport.add_connection(Some(PeerAddress::new("10.4.0.1", 7340)), Direction::Inbound);

        // A few live connections to report
        for i in 0..3 {
            transport.add_connection(
                Some(PeerAddress::new(format!("10.4.1.{}", i), 7340)),
                Direction::Outbound,
            );
        }

        exchange.on_get_peers(&requester, 99).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            NetworkMessage::Peers { peers, nonce } => {
                assert_eq!(*nonce, 99);
                assert_eq!(peers.len(), 3);
                // The requester is never reported back to itself
                assert!(peers
                    .iter()
                    .all(|p| p.address != PeerAddress::new("10.4.0.1", 7340)));
            }
            other => panic!("Expected Peers, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn peers_response_merges_into_pools() {
        let (_dir, transport, exchange) = setup();
        let sender =
            transport.add_connection(Some(PeerAddress::new("10.4.0.2", 7340)), Direction::Outbound);

        let gossiped: Vec<Peer> = (0..4)
            .map(|i| Peer::new(PeerAddress::new(format!("10.4.2.{}", i), 7340)))
            .collect();
        exchange.on_peers(&sender, gossiped).await;

        assert_eq!(exchange.peer_manager.reported_peers().await.len(), 4);
    }
}
