//! Daemon assembly.
//!
//! Builds the component graph, routes transport events to the right
//! handler and exposes the small public surface callers use:
//! `request_broadcast`, `request_state_hashes_from`, the mailbox send and
//! acknowledge calls, and listener registration on each component.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::ClockWatcher;
use crate::config::Config;
use crate::error::{AppError, MailboxError};
use crate::mailbox::envelope::KeyRing;
use crate::mailbox::service::{MailboxEvent, MailboxService, SendOutcome};
use crate::mailbox::store::DataStore;
use crate::monitor::hash::StreamId;
use crate::monitor::service::{EpochSource, MonitorEvent, StateMonitor};
use crate::network::broadcaster::{BroadcastOperation, Broadcaster};
use crate::network::connection::{Transport, TransportEvent};
use crate::network::message::NetworkMessage;
use crate::network::peer::{Capability, PeerAddress};
use crate::network::peer_exchange::PeerExchange;
use crate::network::peer_manager::{ConnectivityEvent, PeerManager};
use crate::network::tcp::TcpTransport;
use crate::storage::NodeStore;

/// Delay between going online and declaring bootstrap complete when the
/// initial exchange produced no data (e.g. first node in the network).
const BOOTSTRAP_FALLBACK: Duration = Duration::from_secs(20);

pub struct Node {
    pub config: Config,
    transport: Arc<TcpTransport>,
    store: Arc<NodeStore>,
    keyring: Arc<KeyRing>,
    pub peer_manager: Arc<PeerManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub peer_exchange: Arc<PeerExchange>,
    monitors: RwLock<HashMap<StreamId, Arc<StateMonitor>>>,
    pub data_store: Arc<DataStore>,
    pub mailbox: Arc<MailboxService>,
    clock: ClockWatcher,
    cancel: CancellationToken,
}

impl Node {
    pub fn build(config: Config) -> Result<Arc<Self>, AppError> {
        let data_dir = config.node.resolved_data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let store = Arc::new(NodeStore::open(&data_dir.join("db"))?);
        let keyring = Arc::new(store.load_or_create_keyring()?);

        let capabilities = vec![
            Capability::PeerExchange,
            Capability::StateMonitor,
            Capability::Mailbox,
        ];
        let transport = TcpTransport::new(config.node.network.clone(), capabilities);

        let peer_manager = PeerManager::new(
            transport.clone(),
            store.clone(),
            config.network.clone(),
        );
        let broadcaster = Broadcaster::new(
            transport.clone(),
            config.broadcast.per_peer_timeout(),
            config.broadcast.relay_fan_out,
            Duration::from_millis(config.broadcast.base_stagger_ms),
        );
        let peer_exchange = PeerExchange::new(transport.clone(), peer_manager.clone());
        let data_store = DataStore::new(broadcaster.clone());
        let mailbox = MailboxService::new(
            transport.clone(),
            peer_manager.clone(),
            data_store.clone(),
            store.clone(),
            keyring.clone(),
            config.mailbox.clone(),
        );

        Ok(Arc::new(Self {
            config,
            transport,
            store,
            keyring,
            peer_manager,
            broadcaster,
            peer_exchange,
            monitors: RwLock::new(HashMap::new()),
            data_store,
            mailbox,
            clock: ClockWatcher::new(),
            cancel: CancellationToken::new(),
        }))
    }

    /// The state-computation layer registers each stream it can evaluate.
    /// One monitor instance per stream.
    pub async fn register_monitor(
        self: &Arc<Self>,
        stream: StreamId,
        source: Arc<dyn EpochSource>,
    ) -> Arc<StateMonitor> {
        let transport: Arc<dyn Transport> = self.transport.clone();
        let monitor = StateMonitor::new(
            stream,
            source,
            transport,
            self.peer_manager.clone(),
            self.broadcaster.clone(),
            self.config.monitor.clone(),
        );
        self.monitors.write().await.insert(stream, monitor.clone());
        monitor
    }

    pub async fn monitor(&self, stream: StreamId) -> Option<Arc<StateMonitor>> {
        self.monitors.read().await.get(&stream).cloned()
    }

    /// Bring the node online: persisted state, listeners, the transport
    /// dispatch loop, seed dialing and the bootstrap trigger.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        self.peer_manager.read_persisted().await?;
        self.mailbox.load_persisted().await?;

        self.clock.start();
        self.peer_manager.listen_for_standby(&self.clock);
        self.peer_exchange.start();
        self.mailbox.start();
        self.spawn_dispatch();
        self.spawn_reconnect_on_loss();

        let bound = self
            .transport
            .listen(&self.config.network.listen_address)
            .await?;
        if let Ok(address) = format!("{}", bound).parse::<PeerAddress>() {
            self.transport.set_local_address(address);
        }

        self.connect_to_seeds().await;

        // Bootstrap completes after the initial exchange settles; the
        // fallback covers a network where we are the first node up
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(BOOTSTRAP_FALLBACK) => {}
                _ = this.cancel.cancelled() => return,
            }
            this.on_bootstrap_complete().await;
        });

        info!("Node online as {:?}", self.transport.local_address());
        Ok(())
    }

    async fn on_bootstrap_complete(self: &Arc<Self>) {
        self.mailbox.set_bootstrapped().await;
        for monitor in self.monitors.read().await.values() {
            monitor.request_hashes_from_seeds().await;
        }
    }

    async fn connect_to_seeds(self: &Arc<Self>) {
        for seed in self.config.network.seed_addresses() {
            if self.peer_manager.is_self(&seed) {
                continue;
            }
            match self.transport.connect(&seed).await {
                Ok(_) => debug!("Connected to seed {}", seed),
                Err(e) => {
                    warn!("Seed {} unreachable: {}", seed, e);
                    self.peer_manager.handle_connection_fault(&seed, false).await;
                }
            }
        }
    }

    /// After a total loss or standby wake-up, dial seeds again.
    fn spawn_reconnect_on_loss(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.peer_manager.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ConnectivityEvent::AllConnectionsLost)
                        | Ok(ConnectivityEvent::AwakeFromStandby) => {
                            tokio::time::sleep(Duration::from_secs(3)).await;
                            this.connect_to_seeds().await;
                        }
                        Ok(ConnectivityEvent::NewConnectionAfterAllLost) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_dispatch(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.transport.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => this.handle_transport_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Dispatch lagged {} transport event(s)", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Established(connection) => {
                self.peer_manager.on_connection_established(&connection).await;
            }
            TransportEvent::Closed(connection, reason) => {
                self.peer_manager
                    .on_connection_closed(&connection, reason)
                    .await;
            }
            TransportEvent::Message(connection, message) => match message {
                NetworkMessage::GetPeers { nonce } => {
                    self.peer_exchange.on_get_peers(&connection, nonce).await;
                }
                NetworkMessage::Peers { peers, .. } => {
                    self.peer_exchange.on_peers(&connection, peers).await;
                }
                NetworkMessage::GetStateHashes {
                    stream,
                    from_height,
                    nonce,
                } => {
                    if let Some(monitor) = self.monitor(stream).await {
                        monitor.on_hash_request(&connection, from_height, nonce).await;
                    }
                }
                NetworkMessage::StateHashes { stream, hashes, .. } => {
                    if let Some(monitor) = self.monitor(stream).await {
                        monitor
                            .on_peer_state_hashes(
                                connection.peer_address(),
                                connection.id(),
                                hashes,
                            )
                            .await;
                    }
                }
                NetworkMessage::NewStateHash { stream, hash } => {
                    if let Some(monitor) = self.monitor(stream).await {
                        monitor
                            .on_peer_state_hash(
                                connection.peer_address(),
                                connection.id(),
                                hash.clone(),
                            )
                            .await;
                    }
                    // Relay with the capped fan-out; we are not the owner
                    self.broadcaster.broadcast(
                        NetworkMessage::NewStateHash { stream, hash },
                        connection.peer_address().as_ref(),
                        false,
                    );
                }
                NetworkMessage::AddMailboxData { entry } => {
                    if let Some(from) = connection.peer_address() {
                        self.data_store.on_add_from_network(entry, &from).await;
                    }
                }
                NetworkMessage::RemoveMailboxData { entry_id } => {
                    if let Some(from) = connection.peer_address() {
                        self.data_store
                            .on_remove_from_network(&entry_id, &from)
                            .await;
                    }
                }
                NetworkMessage::MailboxDirect { entry } => {
                    self.mailbox.on_direct(entry).await;
                }
                // Handled inside the transport
                NetworkMessage::Handshake { .. }
                | NetworkMessage::Ping { .. }
                | NetworkMessage::Pong { .. } => {}
            },
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Public surface
    ///////////////////////////////////////////////////////////////////////

    pub fn request_broadcast(
        self: &Arc<Self>,
        message: NetworkMessage,
        exclude: Option<&PeerAddress>,
        is_data_owner: bool,
    ) -> Arc<BroadcastOperation> {
        self.broadcaster.broadcast(message, exclude, is_data_owner)
    }

    /// Ask every connected peer for state hashes from a height upward.
    pub async fn request_state_hashes_from(self: &Arc<Self>, stream: StreamId, from_height: u64) {
        let message = NetworkMessage::GetStateHashes {
            stream,
            from_height,
            nonce: rand::random(),
        };
        for connection in self.transport.connections() {
            if !connection.has_capability(Capability::StateMonitor) {
                continue;
            }
            if let Err(e) = self.transport.send(&connection, message.clone()).await {
                debug!("State hash request failed: {}", e);
            }
        }
    }

    pub async fn send_mailbox_message(
        &self,
        recipient: &PeerAddress,
        recipient_key: &[u8; 32],
        body: Vec<u8>,
    ) -> Result<SendOutcome, MailboxError> {
        self.mailbox.send(recipient, recipient_key, body).await
    }

    pub fn acknowledge_mailbox_message(&self, message_id: &str) {
        self.mailbox.acknowledge(message_id);
    }

    /// Listener registration, one channel per concern.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.peer_manager.subscribe()
    }

    pub async fn subscribe_conflicts(
        &self,
        stream: StreamId,
    ) -> Option<broadcast::Receiver<MonitorEvent>> {
        self.monitors.read().await.get(&stream).map(|m| m.subscribe())
    }

    pub fn subscribe_mailbox(&self) -> broadcast::Receiver<MailboxEvent> {
        self.mailbox.subscribe()
    }

    /// Our exchange key, which senders seal mailbox messages to.
    pub fn mailbox_key(&self) -> [u8; 32] {
        self.keyring.exchange_public()
    }

    pub async fn shutdown(self: &Arc<Self>) {
        info!("Shutting down");
        self.cancel.cancel();
        self.clock.shutdown();
        self.peer_exchange.shutdown();
        self.broadcaster.shutdown();
        self.mailbox.shutdown();
        for monitor in self.monitors.read().await.values() {
            monitor.shutdown();
        }
        self.peer_manager.shutdown();
        self.transport.shutdown();
        if let Err(e) = self.store.flush() {
            warn!("Final store flush failed: {}", e);
        }
    }
}
