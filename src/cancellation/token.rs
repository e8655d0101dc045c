/// Per-operation cancellation token
///
/// Wraps a `tokio_util` token so async code can await cancellation inside
/// `select!`, and adds the reason/message pair plus callbacks fired exactly
/// once on the first successful `cancel`.
use crate::{OpguardError, OpguardResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Why an operation was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    Timeout,
    SystemShutdown,
    ErrorThreshold,
    ParentCancelled,
    ResourceLimit,
    Superseded,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::UserRequested => "user_requested",
            CancelReason::Timeout => "timeout",
            CancelReason::SystemShutdown => "system_shutdown",
            CancelReason::ErrorThreshold => "error_threshold",
            CancelReason::ParentCancelled => "parent_cancelled",
            CancelReason::ResourceLimit => "resource_limit",
            CancelReason::Superseded => "superseded",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason, message and time of a cancellation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationDetails {
    pub reason: CancelReason,
    pub message: String,
    pub cancelled_at: DateTime<Utc>,
}

type CancelCallback = Box<dyn FnOnce(&CancellationDetails) + Send>;

struct Inner {
    operation_id: String,
    signal: tokio_util::sync::CancellationToken,
    flipped: AtomicBool,
    details: Mutex<Option<CancellationDetails>>,
    callbacks: Mutex<Vec<CancelCallback>>,
}

/// Thread-safe cancellation flag shared by reference
///
/// Clones observe the same flag. A token belongs to exactly one operation.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                operation_id: operation_id.into(),
                signal: tokio_util::sync::CancellationToken::new(),
                flipped: AtomicBool::new(false),
                details: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.inner.operation_id
    }

    /// Cancel the token
    ///
    /// Returns false when the token was already cancelled; callbacks only run
    /// on the first call.
    pub fn cancel(&self, reason: CancelReason, message: impl Into<String>) -> bool {
        // Flip, details and callback hand-off happen under the callback lock
        // so a concurrent `on_cancel` either registers before or sees details
        let (details, callbacks) = {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if self
                .inner
                .flipped
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return false;
            }

            let details = CancellationDetails {
                reason,
                message: message.into(),
                cancelled_at: Utc::now(),
            };
            *self.lock_details() = Some(details.clone());
            (details, std::mem::take(&mut *callbacks))
        };

        self.inner.signal.cancel();

        for callback in callbacks {
            run_callback(&self.inner.operation_id, callback, &details);
        }

        tracing::debug!(
            operation_id = %self.inner.operation_id,
            reason = %reason,
            message = %details.message,
            "Cancellation token flipped"
        );
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flipped.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await;
    }

    pub fn details(&self) -> Option<CancellationDetails> {
        self.lock_details().clone()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.lock_details().as_ref().map(|d| d.reason)
    }

    /// Register a callback for cancellation
    ///
    /// Runs immediately (on the calling thread) if the token is already
    /// cancelled. A panicking callback is logged and does not affect others.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&CancellationDetails) + Send + 'static,
    {
        {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }

        if let Some(details) = self.details() {
            run_callback(&self.inner.operation_id, Box::new(callback), &details);
        }
    }

    /// `Err(Cancelled)` once the token is cancelled
    pub fn check(&self) -> OpguardResult<()> {
        if self.is_cancelled() {
            Err(self.cancellation_error())
        } else {
            Ok(())
        }
    }

    /// Error describing this token's cancellation
    pub fn cancellation_error(&self) -> OpguardError {
        let (reason, message) = match self.details() {
            Some(details) => (details.reason, details.message),
            None => (CancelReason::UserRequested, "cancelled".to_string()),
        };
        OpguardError::Cancelled {
            operation_id: self.inner.operation_id.clone(),
            reason,
            message,
        }
    }

    /// Run `fut` until it finishes or the token is cancelled
    pub async fn run_until_cancelled<F>(&self, fut: F) -> OpguardResult<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.cancellation_error()),
            output = fut => Ok(output),
        }
    }

    /// Wait for cancellation by polling the flag every `interval`
    ///
    /// Fallback for code that cannot hold the future; returns false if
    /// `max_wait` elapses first.
    pub async fn wait_polling(&self, interval: Duration, max_wait: Duration) -> bool {
        let interval = interval.max(Duration::from_millis(1));
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Underlying `tokio_util` token, e.g. for child tokens in other libraries
    pub fn signal(&self) -> tokio_util::sync::CancellationToken {
        self.inner.signal.clone()
    }

    fn lock_details(&self) -> std::sync::MutexGuard<'_, Option<CancellationDetails>> {
        self.inner.details.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("operation_id", &self.inner.operation_id)
            .field("cancelled", &self.is_cancelled())
            .field("details", &self.details())
            .finish()
    }
}

fn run_callback(operation_id: &str, callback: CancelCallback, details: &CancellationDetails) {
    if catch_unwind(AssertUnwindSafe(|| callback(details))).is_err() {
        tracing::error!(operation_id = operation_id, "Cancellation callback panicked");
    }
}
