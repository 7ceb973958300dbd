//! Standby/idle detection.
//!
//! A one-second ticker compares the wall time that actually elapsed with
//! the time the ticks account for. When the process was suspended (laptop
//! standby, container freeze) the gap exceeds the tolerance and listeners
//! get an `AwakeFromStandby` event, so connectivity can be re-armed even
//! though sockets may still look open.

use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Missed wall time beyond this means we were suspended
const STANDBY_TOLERANCE: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
pub enum ClockEvent {
    AwakeFromStandby { missed_ms: u64 },
}

pub struct ClockWatcher {
    events: broadcast::Sender<ClockEvent>,
    cancel: CancellationToken,
}

impl ClockWatcher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.events.subscribe()
    }

    /// Spawn the ticker. Cancelling twice is safe.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut last_tick = Instant::now();
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let elapsed = now.duration_since(last_tick);
                        last_tick = now;
                        if elapsed > TICK + STANDBY_TOLERANCE {
                            let missed_ms = (elapsed - TICK).as_millis() as u64;
                            tracing::info!("Awake from standby, missed {} ms", missed_ms);
                            let _ = events.send(ClockEvent::AwakeFromStandby { missed_ms });
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for ClockWatcher {
    fn default() -> Self {
        Self::new()
    }
}
