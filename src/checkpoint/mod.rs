/// Transactional state management for operations
///
/// Snapshots externally owned state before an operation (or one of its
/// sub-steps) runs and restores it on demand:
/// - [`StateAccessor`] is the seam to whoever owns the real state
/// - [`CheckpointManager`] keeps a bounded, globally ordered checkpoint stack
/// - [`CheckpointManager::with_transaction`] wraps a block with automatic rollback
///
/// # Usage Example
///
/// ```rust,ignore
/// use opguard::checkpoint::{CheckpointManager, RollbackScope, SharedState};
/// use std::sync::Arc;
///
/// let manager = CheckpointManager::default();
/// let document = SharedState::new(serde_json::json!({"body": "draft"}));
/// manager.register_accessor(RollbackScope::DocumentState, Arc::new(document.clone()))?;
///
/// let cp = manager.create_checkpoint("op-42", RollbackScope::DocumentState, "before rewrite")?;
/// document.update(|d| d["body"] = "rewritten".into());
/// manager.rollback_to(&cp, "user pressed undo")?;
/// # Ok::<(), opguard::OpguardError>(())
/// ```
pub mod manager;
pub mod state;

pub use manager::{
    CheckpointManager, CheckpointSummary, CompensatingAction, OperationCheckpoint, RollbackKind,
    RollbackStats, DEFAULT_MAX_CHECKPOINTS,
};
pub use state::{RollbackScope, SharedState, Snapshot, StateAccessor};
