//! TCP transport adapter.
//!
//! The one concrete [`Transport`] in the repo: framed TCP sessions with a
//! handshake exchanging protocol version, announced address and
//! capabilities. The core components only ever see the trait, so an
//! onion-routed or in-memory transport slots in without touching them.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::network::connection::{
    CloseReason, Connection, Direction, RuleViolation, Transport, TransportEvent,
};
use crate::network::message::{NetworkMessage, PROTOCOL_VERSION};
use crate::network::peer::{Capability, PeerAddress};
use crate::network::wire;

pub struct TcpTransport {
    network: String,
    local_address: parking_lot::RwLock<Option<PeerAddress>>,
    capabilities: Vec<Capability>,
    connections: DashMap<u64, Arc<Connection>>,
    writers: DashMap<u64, Arc<Mutex<OwnedWriteHalf>>>,
    events: broadcast::Sender<TransportEvent>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl TcpTransport {
    pub fn new(network: String, capabilities: Vec<Capability>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            network,
            local_address: parking_lot::RwLock::new(None),
            capabilities,
            connections: DashMap::new(),
            writers: DashMap::new(),
            events,
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    pub fn set_local_address(&self, address: PeerAddress) {
        *self.local_address.write() = Some(address);
    }

    /// Bind and start accepting inbound connections. Returns the bound
    /// address (useful when binding port 0).
    pub async fn listen(self: &Arc<Self>, bind_addr: &str) -> std::io::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await?;
        let bound = listener.local_addr()?;
        info!("Listening on {}", bound);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!("Inbound connection from {}", addr);
                            this.register(stream, Direction::Inbound, None).await;
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                        }
                    },
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
        Ok(bound)
    }

    /// Dial a peer and perform the handshake.
    pub async fn connect(self: &Arc<Self>, address: &PeerAddress) -> Result<Arc<Connection>, NetworkError> {
        let stream = TcpStream::connect(address.to_string())
            .await
            .map_err(|e| NetworkError::SendFailed {
                peer: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(self
            .register(stream, Direction::Outbound, Some(address.clone()))
            .await)
    }

    async fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        direction: Direction,
        peer_address: Option<PeerAddress>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new(id, direction, peer_address));
        let (reader, writer) = stream.into_split();
        self.connections.insert(id, connection.clone());
        self.writers.insert(id, Arc::new(Mutex::new(writer)));

        // Announce ourselves first; the peer mirrors with its own handshake
        let handshake = NetworkMessage::Handshake {
            protocol_version: PROTOCOL_VERSION,
            network: self.network.clone(),
            listen_addr: self.local_address(),
            capabilities: self.capabilities.clone(),
        };
        if let Err(e) = self.write_to(id, &handshake).await {
            debug!("Handshake to connection {} failed: {}", id, e);
        }

        let _ = self
            .events
            .send(TransportEvent::Established(connection.clone()));

        let this = self.clone();
        let conn = connection.clone();
        tokio::spawn(async move {
            this.read_loop(conn, reader).await;
        });
        connection
    }

    async fn read_loop(self: &Arc<Self>, connection: Arc<Connection>, mut reader: OwnedReadHalf) {
        loop {
            tokio::select! {
                frame = wire::read_message(&mut reader) => match frame {
                    Ok(Some((message, size))) => {
                        connection.statistics().record_received(size as u64);
                        self.dispatch(&connection, message).await;
                    }
                    Ok(None) => {
                        self.drop_connection(&connection, CloseReason::Remote).await;
                        return;
                    }
                    Err(NetworkError::FrameTooLarge { .. }) => {
                        connection.report_violation(RuleViolation::OversizedFrame);
                        self.drop_connection(&connection, CloseReason::RuleViolation).await;
                        return;
                    }
                    Err(NetworkError::VersionMismatch { ours, theirs }) => {
                        warn!(
                            "Closing connection {}: protocol version {} vs our {}",
                            connection.id(), theirs, ours
                        );
                        self.drop_connection(&connection, CloseReason::Remote).await;
                        return;
                    }
                    Err(e) => {
                        debug!("Read on connection {} failed: {}", connection.id(), e);
                        self.drop_connection(&connection, CloseReason::IoError).await;
                        return;
                    }
                },
                _ = self.cancel.cancelled() => {
                    self.drop_connection(&connection, CloseReason::Shutdown).await;
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, connection: &Arc<Connection>, message: NetworkMessage) {
        match message {
            NetworkMessage::Handshake {
                protocol_version,
                network,
                listen_addr,
                capabilities,
            } => {
                if network != self.network {
                    warn!(
                        "Closing connection {}: wrong network {:?}",
                        connection.id(),
                        network
                    );
                    self.drop_connection(connection, CloseReason::Remote).await;
                    return;
                }
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "Closing connection {}: protocol version {}",
                        connection.id(),
                        protocol_version
                    );
                    self.drop_connection(connection, CloseReason::Remote).await;
                    return;
                }
                if let Some(address) = listen_addr {
                    if !connection.has_peer_address() {
                        connection.set_peer_address(address);
                    }
                }
                connection.apply_capabilities(&capabilities);
            }
            NetworkMessage::Ping { nonce } => {
                let _ = self
                    .send(connection, NetworkMessage::Pong { nonce })
                    .await;
            }
            other => {
                let _ = self
                    .events
                    .send(TransportEvent::Message(connection.clone(), other));
            }
        }
    }

    async fn write_to(&self, connection_id: u64, message: &NetworkMessage) -> Result<usize, NetworkError> {
        let writer = self
            .writers
            .get(&connection_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| NetworkError::ConnectionGone(connection_id.to_string()))?;
        let frame = wire::serialize_frame(message)?;
        let mut writer = writer.lock().await;
        tokio::io::AsyncWriteExt::write_all(&mut *writer, &frame)
            .await
            .map_err(|e| NetworkError::SendFailed {
                peer: connection_id.to_string(),
                reason: e.to_string(),
            })?;
        tokio::io::AsyncWriteExt::flush(&mut *writer)
            .await
            .map_err(|e| NetworkError::SendFailed {
                peer: connection_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(frame.len())
    }

    async fn drop_connection(&self, connection: &Arc<Connection>, reason: CloseReason) {
        if self.connections.remove(&connection.id()).is_some() {
            self.writers.remove(&connection.id());
            let _ = self
                .events
                .send(TransportEvent::Closed(connection.clone(), reason));
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_address(&self) -> Option<PeerAddress> {
        self.local_address.read().clone()
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    async fn send(
        &self,
        connection: &Connection,
        message: NetworkMessage,
    ) -> Result<(), NetworkError> {
        let size = self.write_to(connection.id(), &message).await?;
        connection.statistics().record_sent(size as u64);
        Ok(())
    }

    async fn close(&self, connection: &Connection, reason: CloseReason) {
        if let Some((_, connection)) = self.connections.remove(&connection.id()) {
            self.writers.remove(&connection.id());
            let _ = self
                .events
                .send(TransportEvent::Closed(connection, reason));
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_confirms_address_and_capabilities() {
        let server = TcpTransport::new("testnet".to_string(), vec![Capability::PeerExchange]);
        let client = TcpTransport::new("testnet".to_string(), vec![Capability::Mailbox]);
        client.set_local_address(PeerAddress::new("127.0.0.1", 9911));

        let bound = server.listen("127.0.0.1:0").await.unwrap();

        let connection = client
            .connect(&PeerAddress::new("127.0.0.1", bound.port()))
            .await
            .unwrap();

        // Wait for the mirrored handshakes to land
        for _ in 0..100 {
            if connection.has_capability(Capability::PeerExchange)
                && !server.connections().is_empty()
                && server.connections()[0].has_peer_address()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(connection.has_capability(Capability::PeerExchange));
        let inbound = &server.connections()[0];
        assert_eq!(
            inbound.peer_address(),
            Some(PeerAddress::new("127.0.0.1", 9911))
        );
        assert!(inbound.has_capability(Capability::Mailbox));

        server.shutdown();
        client.shutdown();
    }

    #[tokio::test]
    async fn message_roundtrip_over_loopback() {
        let server = TcpTransport::new("testnet".to_string(), vec![]);
        let client = TcpTransport::new("testnet".to_string(), vec![]);

        let bound = server.listen("127.0.0.1:0").await.unwrap();
        let mut server_events = server.subscribe();

        let connection = client
            .connect(&PeerAddress::new("127.0.0.1", bound.port()))
            .await
            .unwrap();
        client
            .send(&connection, NetworkMessage::GetPeers { nonce: 7 })
            .await
            .unwrap();

        loop {
            match server_events.recv().await.unwrap() {
                TransportEvent::Message(_, NetworkMessage::GetPeers { nonce }) => {
                    assert_eq!(nonce, 7);
                    break;
                }
                _ => continue,
            }
        }

        server.shutdown();
        client.shutdown();
    }
}
