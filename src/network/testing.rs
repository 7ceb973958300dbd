//! In-memory transport double for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::NetworkError;
use crate::network::connection::{
    CloseReason, Connection, Direction, Transport, TransportEvent,
};
use crate::network::message::NetworkMessage;
use crate::network::peer::PeerAddress;

pub struct MockTransport {
    connections: Mutex<Vec<Arc<Connection>>>,
    sent: Mutex<Vec<(u64, NetworkMessage)>>,
    closed: Mutex<Vec<(u64, CloseReason)>>,
    /// When set, every send fails with a transient fault
    pub fail_sends: AtomicBool,
    /// When set, every send hangs until cancelled (for timeout tests)
    pub hang_sends: AtomicBool,
    local_address: Option<PeerAddress>,
    events: broadcast::Sender<TransportEvent>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            connections: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            hang_sends: AtomicBool::new(false),
            local_address: Some(PeerAddress::new("127.0.0.1", 7340)),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_connection(
        &self,
        address: Option<PeerAddress>,
        direction: Direction,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new(id, direction, address));
        self.connections.lock().push(connection.clone());
        connection
    }

    pub fn remove_connection(&self, id: u64) {
        self.connections.lock().retain(|c| c.id() != id);
    }

    pub fn sent(&self) -> Vec<(u64, NetworkMessage)> {
        self.sent.lock().clone()
    }

    pub fn closed(&self) -> Vec<(u64, CloseReason)> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_address(&self) -> Option<PeerAddress> {
        self.local_address.clone()
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    async fn send(
        &self,
        connection: &Connection,
        message: NetworkMessage,
    ) -> Result<(), NetworkError> {
        if self.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(NetworkError::SendFailed {
                peer: format!("{:?}", connection.peer_address()),
                reason: "mock failure".to_string(),
            });
        }
        connection.statistics().record_sent(64);
        self.sent.lock().push((connection.id(), message));
        Ok(())
    }

    async fn close(&self, connection: &Connection, reason: CloseReason) {
        self.remove_connection(connection.id());
        self.closed.lock().push((connection.id(), reason));
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
