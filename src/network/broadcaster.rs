//! Best-effort reliable broadcast to a random subset of live connections.
//!
//! One [`BroadcastOperation`] per logical fan-out. Sends are staggered with
//! randomized, increasing delays so simultaneous broadcasts from many nodes
//! do not synchronize, relays are capped to bound amplification, and one
//! overall timeout sized to the target count guarantees the operation
//! finalizes exactly once.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::network::connection::{Connection, Transport};
use crate::network::message::NetworkMessage;
use crate::network::peer::PeerAddress;

#[derive(Clone, Debug)]
pub enum BroadcastEvent {
    /// The first target acknowledged the send; fired at most once
    FirstPeerReached { operation_id: u64 },
    /// The operation finalized; fired exactly once
    Completed {
        operation_id: u64,
        completed: usize,
        failed: usize,
        timed_out: bool,
    },
    /// The broadcast reached nobody. A fault notification, not an error.
    Fault { operation_id: u64, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcastResult {
    pub num_targets: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: bool,
}

/// One logical fan-out. Invariant: once `completed + failed == targets`
/// (or the timeout fires, or it is cancelled) it finalizes exactly once.
pub struct BroadcastOperation {
    id: u64,
    num_targets: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    finalized: AtomicBool,
    first_reached: AtomicBool,
    result_tx: watch::Sender<Option<BroadcastResult>>,
    cancel: CancellationToken,
}

impl BroadcastOperation {
    fn new(id: u64, num_targets: usize) -> Arc<Self> {
        let (result_tx, _) = watch::channel(None);
        Arc::new(Self {
            id,
            num_targets,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            first_reached: AtomicBool::new(false),
            result_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_targets(&self) -> usize {
        self.num_targets
    }

    /// Wait for the final accounting. Resolves immediately when the
    /// operation already finalized.
    pub async fn wait(&self) -> BroadcastResult {
        let mut rx = self.result_tx.subscribe();
        loop {
            if let Some(result) = *rx.borrow() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Sender dropped after finalizing; the borrow above would
                // have seen it. Treat as cancelled.
                return BroadcastResult {
                    num_targets: self.num_targets,
                    completed: self.completed.load(Ordering::SeqCst),
                    failed: self.failed.load(Ordering::SeqCst),
                    timed_out: false,
                };
            }
        }
    }

    /// Cancel the operation. Safe to call twice.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct Broadcaster {
    transport: Arc<dyn Transport>,
    per_peer_timeout: Duration,
    relay_fan_out: usize,
    base_stagger: Duration,
    operations: dashmap::DashMap<u64, Arc<BroadcastOperation>>,
    events: broadcast::Sender<BroadcastEvent>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Broadcaster {
    pub fn new(
        transport: Arc<dyn Transport>,
        per_peer_timeout: Duration,
        relay_fan_out: usize,
        base_stagger: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            transport,
            per_peer_timeout,
            relay_fan_out,
            base_stagger,
            operations: dashmap::DashMap::new(),
            events,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.events.subscribe()
    }

    /// Fan the message out to a shuffled subset of live connections.
    ///
    /// `exclude` drops the original sender when relaying; `is_data_owner`
    /// distinguishes our own data (full fan-out, quick) from relayed data
    /// (capped fan-out, slower stagger).
    pub fn broadcast(
        self: &Arc<Self>,
        message: NetworkMessage,
        exclude: Option<&PeerAddress>,
        is_data_owner: bool,
    ) -> Arc<BroadcastOperation> {
        let mut targets: Vec<Arc<Connection>> = self
            .transport
            .connections()
            .into_iter()
            .filter(|c| c.has_peer_address())
            .filter(|c| c.peer_address().as_ref() != exclude)
            .filter(|c| match message.required_capability() {
                Some(capability) => c.has_capability(capability),
                None => true,
            })
            .collect();

        {
            use rand::seq::SliceRandom;
            targets.shuffle(&mut rand::thread_rng());
        }
        if !is_data_owner && targets.len() > self.relay_fan_out {
            targets.truncate(self.relay_fan_out);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let operation = BroadcastOperation::new(id, targets.len());
        self.operations.insert(id, operation.clone());

        debug!(
            "Broadcast {} of {} to {} target(s), owner={}",
            id,
            message.type_name(),
            targets.len(),
            is_data_owner
        );

        if targets.is_empty() {
            // No connections eligible: a fault to the caller, never an error
            self.finalize(&operation, false, Some("no connections available"));
            return operation;
        }

        // Arm the timeout before the first send so "already done" cannot
        // race "timed out" into a double finalization.
        let timeout = self.per_peer_timeout * targets.len() as u32;
        {
            let this = self.clone();
            let operation = operation.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        this.finalize(&operation, true, Some("broadcast timed out"));
                    }
                    // Covers both explicit cancellation and the wake-up
                    // after a normal finalization cancelled the token
                    _ = operation.cancel.cancelled() => {
                        this.finalize(&operation, false, None);
                    }
                    _ = this.shutdown.cancelled() => {
                        this.finalize(&operation, false, None);
                    }
                }
            });
        }

        for (index, connection) in targets.into_iter().enumerate() {
            let this = self.clone();
            let operation = operation.clone();
            let message = message.clone();
            let delay = self.stagger_delay(index, is_data_owner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = operation.cancel.cancelled() => return,
                }
                let send = this.transport.send(&connection, message);
                tokio::select! {
                    result = send => {
                        match result {
                            Ok(()) => {
                                operation.completed.fetch_add(1, Ordering::SeqCst);
                                if !operation.first_reached.swap(true, Ordering::SeqCst) {
                                    let _ = this.events.send(BroadcastEvent::FirstPeerReached {
                                        operation_id: operation.id,
                                    });
                                }
                            }
                            Err(e) => {
                                operation.failed.fetch_add(1, Ordering::SeqCst);
                                debug!("Broadcast {} send failed: {}", operation.id, e);
                            }
                        }
                        let done = operation.completed.load(Ordering::SeqCst)
                            + operation.failed.load(Ordering::SeqCst);
                        if done >= operation.num_targets {
                            this.finalize(&operation, false, None);
                        }
                    }
                    _ = operation.cancel.cancelled() => {}
                }
            });
        }

        operation
    }

    /// Randomized, increasing stagger. Relayed data gets a longer
    /// inter-send delay to bound amplification.
    fn stagger_delay(&self, index: usize, is_data_owner: bool) -> Duration {
        let base = self.base_stagger.as_millis().max(1) as u64;
        let jitter = rand::thread_rng().gen_range(base..=base * 2);
        let factor = if is_data_owner { 1 } else { 2 };
        Duration::from_millis(jitter * (index as u64 + 1) * factor)
    }

    fn finalize(
        self: &Arc<Self>,
        operation: &Arc<BroadcastOperation>,
        timed_out: bool,
        fault: Option<&str>,
    ) {
        if operation.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        operation.cancel.cancel();

        let completed = operation.completed.load(Ordering::SeqCst);
        // On timeout the sends still pending count as failed
        let failed = if timed_out {
            operation.num_targets - completed
        } else {
            operation.failed.load(Ordering::SeqCst)
        };

        let result = BroadcastResult {
            num_targets: operation.num_targets,
            completed,
            failed,
            timed_out,
        };
        let _ = operation.result_tx.send(Some(result));

        if let Some(reason) = fault {
            let _ = self.events.send(BroadcastEvent::Fault {
                operation_id: operation.id,
                reason: reason.to_string(),
            });
        } else if completed == 0 && operation.num_targets > 0 {
            let _ = self.events.send(BroadcastEvent::Fault {
                operation_id: operation.id,
                reason: "broadcast reached no peers".to_string(),
            });
        }

        let _ = self.events.send(BroadcastEvent::Completed {
            operation_id: operation.id,
            completed,
            failed,
            timed_out,
        });
        self.operations.remove(&operation.id);

        if timed_out {
            info!(
                "Broadcast {} timed out: completed={}, failed={}",
                operation.id, completed, failed
            );
        } else {
            debug!(
                "Broadcast {} completed: completed={}, failed={}",
                operation.id, completed, failed
            );
        }
    }

    /// Cancel all in-flight operations. Safe to call twice.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        let pending: Vec<Arc<BroadcastOperation>> = self
            .operations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for operation in pending {
            self.finalize(&operation, false, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::Direction;
    use crate::network::peer::Capability;
    use crate::network::testing::MockTransport;
    use crate::monitor::hash::{StateHash, StreamId};

    fn broadcaster(transport: Arc<MockTransport>) -> Arc<Broadcaster> {
        Broadcaster::new(
            transport,
            Duration::from_millis(100),
            7,
            Duration::from_millis(1),
        )
    }

    fn add_peers(transport: &MockTransport, n: usize) -> Vec<Arc<Connection>> {
        (0..n)
            .map(|i| {
                transport.add_connection(
                    Some(PeerAddress::new(format!("10.3.0.{}", i), 7340)),
                    Direction::Outbound,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn all_sends_succeeding_completes_with_full_count() {
        let transport = Arc::new(MockTransport::new());
        add_peers(&transport, 3);
        let broadcaster = broadcaster(transport.clone());
        let mut events = broadcaster.subscribe();

        let operation = broadcaster.broadcast(NetworkMessage::Ping { nonce: 1 }, None, true);
        let result = operation.wait().await;

        assert_eq!(result.completed, 3);
        assert_eq!(result.failed, 0);
        assert!(!result.timed_out);
        assert_eq!(transport.sent().len(), 3);

        // Exactly one FirstPeerReached and one Completed
        let mut first = 0;
        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                BroadcastEvent::FirstPeerReached { .. } => first += 1,
                BroadcastEvent::Completed { .. } => completed += 1,
                BroadcastEvent::Fault { .. } => panic!("unexpected fault"),
            }
        }
        assert_eq!(first, 1);
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn hanging_sends_time_out_with_one_fault_and_one_completion() {
        let transport = Arc::new(MockTransport::new());
        transport.hang_sends.store(true, Ordering::SeqCst);
        add_peers(&transport, 2);

        let broadcaster = Broadcaster::new(
            transport.clone(),
            Duration::from_millis(20),
            7,
            Duration::from_millis(1),
        );
        let mut events = broadcaster.subscribe();

        let operation = broadcaster.broadcast(NetworkMessage::Ping { nonce: 2 }, None, true);
        let result = operation.wait().await;

        assert!(result.timed_out);
        assert_eq!(result.completed, 0);
        assert_eq!(result.failed, 2);

        let mut faults = 0;
        let mut completions = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                BroadcastEvent::Fault { .. } => faults += 1,
                BroadcastEvent::Completed {
                    completed, failed, ..
                } => {
                    completions += 1;
                    assert_eq!((completed, failed), (0, 2));
                }
                BroadcastEvent::FirstPeerReached { .. } => panic!("nothing was reached"),
            }
        }
        assert_eq!(faults, 1);
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn relay_fan_out_is_capped() {
        let transport = Arc::new(MockTransport::new());
        add_peers(&transport, 12);
        let broadcaster = broadcaster(transport.clone());

        let operation = broadcaster.broadcast(NetworkMessage::Ping { nonce: 3 }, None, false);
        assert_eq!(operation.num_targets(), 7);

        let owner_operation = broadcaster.broadcast(NetworkMessage::Ping { nonce: 4 }, None, true);
        assert_eq!(owner_operation.num_targets(), 12);
    }

    #[tokio::test]
    async fn excluded_sender_is_skipped() {
        let transport = Arc::new(MockTransport::new());
        let connections = add_peers(&transport, 3);
        let excluded = connections[0].peer_address().unwrap();
        let broadcaster = broadcaster(transport.clone());

        let operation =
            broadcaster.broadcast(NetworkMessage::Ping { nonce: 5 }, Some(&excluded), true);
        let result = operation.wait().await;

        assert_eq!(result.completed, 2);
        assert!(transport
            .sent()
            .iter()
            .all(|(id, _)| *id != connections[0].id()));
    }

    #[tokio::test]
    async fn missing_capability_skips_connection() {
        let transport = Arc::new(MockTransport::new());
        let connections = add_peers(&transport, 2);
        connections[0].apply_capabilities(&[Capability::StateMonitor]);
        let broadcaster = broadcaster(transport.clone());

        let message = NetworkMessage::NewStateHash {
            stream: StreamId::Ledger,
            hash: StateHash::new(1, [0u8; 20], 0),
        };
        let operation = broadcaster.broadcast(message, None, true);
        assert_eq!(operation.num_targets(), 1);
        let result = operation.wait().await;
        assert_eq!(result.completed, 1);
    }

    #[tokio::test]
    async fn zero_reachable_peers_is_a_fault_not_an_error() {
        let transport = Arc::new(MockTransport::new());
        let broadcaster = broadcaster(transport);
        let mut events = broadcaster.subscribe();

        let operation = broadcaster.broadcast(NetworkMessage::Ping { nonce: 6 }, None, true);
        let result = operation.wait().await;

        assert_eq!(result.num_targets, 0);
        assert_eq!(result.completed, 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            BroadcastEvent::Fault { .. }
        ));
    }

    #[tokio::test]
    async fn cancelling_twice_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        transport.hang_sends.store(true, Ordering::SeqCst);
        add_peers(&transport, 2);
        let broadcaster = broadcaster(transport);

        let operation = broadcaster.broadcast(NetworkMessage::Ping { nonce: 7 }, None, true);
        operation.cancel();
        operation.cancel();
        broadcaster.shutdown();
        broadcaster.shutdown();

        let result = operation.wait().await;
        assert!(!result.timed_out);
    }
}
