/// Progress and error notifications
///
/// The core emits abstract events; rendering them (web sockets, terminals,
/// logs) is up to registered [`NotificationSink`]s. Sinks are called
/// synchronously on the emitting thread and must not block.
use crate::cancellation::OperationProgress;
use crate::error::ErrorResponse;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Receiver of progress and error events
pub trait NotificationSink: Send + Sync {
    fn on_progress(&self, progress: &OperationProgress);

    fn on_error(&self, response: &ErrorResponse);
}

/// Fan-out to every registered sink
#[derive(Default)]
pub struct NotificationHub {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn progress(&self, progress: &OperationProgress) {
        for sink in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| sink.on_progress(progress))).is_err() {
                tracing::error!(
                    operation_id = %progress.operation_id,
                    "Notification sink panicked on progress event"
                );
            }
        }
    }

    pub fn error(&self, response: &ErrorResponse) {
        for sink in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| sink.on_error(response))).is_err() {
                tracing::error!(
                    error_id = %response.error_id,
                    "Notification sink panicked on error event"
                );
            }
        }
    }

    // Sinks are called without holding the lock so they may register others
    fn snapshot(&self) -> Vec<Arc<dyn NotificationSink>> {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Writes every event to the `tracing` log
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_progress(&self, progress: &OperationProgress) {
        tracing::info!(
            operation_id = %progress.operation_id,
            state = %progress.state,
            percentage = progress.percentage,
            step = %progress.current_step,
            "Operation progress"
        );
    }

    fn on_error(&self, response: &ErrorResponse) {
        tracing::warn!(
            error_id = %response.error_id,
            category = %response.category,
            severity = %response.severity,
            retry_allowed = response.retry_allowed,
            escalated = response.escalated,
            "{}",
            response.user_message
        );
    }
}

/// Event forwarded by [`ChannelSink`]
#[derive(Debug, Clone)]
pub enum Notification {
    Progress(OperationProgress),
    Error(ErrorResponse),
}

/// Forwards events into a bounded tokio channel
///
/// Events are dropped (and counted) when the channel is full or closed.
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events that could not be delivered
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, event: Notification) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl NotificationSink for ChannelSink {
    fn on_progress(&self, progress: &OperationProgress) {
        self.send(Notification::Progress(progress.clone()));
    }

    fn on_error(&self, response: &ErrorResponse) {
        self.send(Notification::Error(response.clone()));
    }
}
