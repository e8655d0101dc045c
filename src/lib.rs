// Allow complex types where needed for boxed async actions and callback lists
#![allow(clippy::type_complexity)]

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod notification;
pub mod retry;
pub mod supervisor;
pub mod ui;

// Re-export the composed core for convenience
pub use cancellation::{
    CancelReason, CancellationScope, CancellationToken, OperationOrchestrator, OperationProgress,
    OperationState, ProgressUpdate,
};
pub use checkpoint::{CheckpointManager, RollbackScope, StateAccessor};
pub use config::OpguardConfig;
pub use error::{
    ErrorCategory, ErrorContext, ErrorResponse, ErrorSeverity, RecoveryDirective,
    UnifiedErrorCoordinator,
};
pub use notification::{NotificationHub, NotificationSink};
pub use retry::{BackoffStrategy, CircuitBreakerRegistry, RetryEngine, RetryPolicy};
pub use supervisor::{ActionContext, OperationFailure, OperationRequest, OperationSupervisor};

use std::time::Duration;
use thiserror::Error;

/// Crate-wide error type
///
/// Business actions report failures as `anyhow::Error`; those are carried
/// unchanged in [`OpguardError::Action`] so the caller sees the last failure
/// exactly as the action produced it.
#[derive(Error, Debug)]
pub enum OpguardError {
    #[error("Circuit breaker for '{service}' is open")]
    CircuitOpen { service: String },

    #[error("Operation {operation_id} cancelled ({reason}): {message}")]
    Cancelled {
        operation_id: String,
        reason: CancelReason,
        message: String,
    },

    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error(transparent)]
    Action(anyhow::Error),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Rollback to checkpoint {checkpoint_id} failed: {message}")]
    RollbackFailed {
        checkpoint_id: String,
        message: String,
    },

    #[error("No state accessor registered for scope {0}")]
    MissingStateAccessor(RollbackScope),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Operation already exists: {0}")]
    OperationExists(String),

    #[error("Operation {0} is no longer active")]
    OperationNotActive(String),

    #[error("Invalid state transition for {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: String,
        from: cancellation::OperationState,
        to: cancellation::OperationState,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audit log error: {0}")]
    Audit(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OpguardError {
    /// Whether this error is a cancellation signal rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OpguardError::Cancelled { .. })
    }

    /// Whether this error was produced by an open circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, OpguardError::CircuitOpen { .. })
    }

    /// Cancellation reason, if this error is a cancellation
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            OpguardError::Cancelled { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for OpguardError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed errors typed when an action re-raises one of ours
        match err.downcast::<OpguardError>() {
            Ok(inner) => inner,
            Err(other) => OpguardError::Action(other),
        }
    }
}

impl From<::config::ConfigError> for OpguardError {
    fn from(err: ::config::ConfigError) -> Self {
        OpguardError::Config(err.to_string())
    }
}

pub type OpguardResult<T> = Result<T, OpguardError>;

#[cfg(test)]
mod lib_tests;
