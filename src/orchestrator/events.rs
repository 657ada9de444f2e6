//! Fire-and-forget lifecycle event fan-out.
//!
//! The tracker hands every appended [`UnitEvent`] to an [`EventSink`].
//! Sinks must never block or fail the caller: a full or closed channel
//! drops the event with a log line instead.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::EventLogger;
use crate::models::unit::UnitEvent;

/// Receives lifecycle events emitted by the tracker.
pub trait EventSink: Send + Sync {
    /// Hand off one event. Must return promptly.
    fn emit(&self, event: UnitEvent);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: UnitEvent) {}
}

/// Sink that forwards events into a bounded channel with `try_send`.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<UnitEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<UnitEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: UnitEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    unit_id = %event.unit_id,
                    seq = event.seq,
                    "event channel full, dropping lifecycle event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(
                    unit_id = %event.unit_id,
                    seq = event.seq,
                    "event channel closed, dropping lifecycle event"
                );
            }
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<UnitEvent>>>,
}

impl RecordingSink {
    /// Create an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<UnitEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: UnitEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Spawn the consumer that drains `rx` into `logger`.
///
/// Write failures are logged and skipped. On cancellation the task drains
/// whatever is already queued before exiting.
#[must_use]
pub fn spawn_event_writer(
    mut rx: mpsc::Receiver<UnitEvent>,
    logger: Arc<dyn EventLogger>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        write_event(logger.as_ref(), &event);
                    }
                    info!("event writer shutting down");
                    break;
                }
                received = rx.recv() => match received {
                    Some(event) => write_event(logger.as_ref(), &event),
                    None => {
                        info!("event channel closed, event writer exiting");
                        break;
                    }
                },
            }
        }
    })
}

fn write_event(logger: &dyn EventLogger, event: &UnitEvent) {
    if let Err(err) = logger.log_event(event) {
        warn!(unit_id = %event.unit_id, seq = event.seq, %err, "failed to persist lifecycle event");
    }
}
