/// Checkpoint stack with rollback and transactional scopes
///
/// Checkpoints are kept on a single bounded, process-wide stack ordered by
/// creation time. Rolling back to a checkpoint restores its snapshot through
/// the registered [`StateAccessor`] and discards that checkpoint together with
/// every checkpoint created after it, regardless of which operation created
/// them.
use super::state::{RollbackScope, Snapshot, StateAccessor};
use crate::{OpguardError, OpguardResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use uuid::Uuid;

/// Default maximum number of checkpoints kept on the stack
pub const DEFAULT_MAX_CHECKPOINTS: usize = 50;

type CompensationFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Undo step executed after state is restored
#[derive(Clone)]
pub struct CompensatingAction {
    /// What the action undoes
    pub description: String,

    action: CompensationFn,
}

impl CompensatingAction {
    pub fn new<F>(description: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            action: Arc::new(action),
        }
    }

    fn run(&self) -> anyhow::Result<()> {
        (self.action)()
    }
}

impl fmt::Debug for CompensatingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensatingAction")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Named, timestamped snapshot of external state
#[derive(Debug, Clone)]
pub struct OperationCheckpoint {
    /// Unique checkpoint identifier (UUID)
    pub id: String,

    /// Operation that created the checkpoint
    pub operation_id: String,

    /// Free-form description ("before table rewrite")
    pub description: String,

    /// Scope restored on rollback
    pub scope: RollbackScope,

    /// Captured state
    pub state: Snapshot,

    /// Undo steps, executed in reverse order on rollback
    pub compensating_actions: Vec<CompensatingAction>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Monotonic creation sequence
    pub sequence: u64,
}

/// Serializable view of a checkpoint without its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub operation_id: String,
    pub description: String,
    pub scope: RollbackScope,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub compensating_actions: usize,
}

impl From<&OperationCheckpoint> for CheckpointSummary {
    fn from(cp: &OperationCheckpoint) -> Self {
        Self {
            id: cp.id.clone(),
            operation_id: cp.operation_id.clone(),
            description: cp.description.clone(),
            scope: cp.scope,
            created_at: cp.created_at,
            sequence: cp.sequence,
            compensating_actions: cp.compensating_actions.len(),
        }
    }
}

/// Who asked for a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackKind {
    /// Explicit caller request
    Manual,

    /// Triggered by a transaction failure or the error coordinator
    Automatic,
}

/// Rollback statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackStats {
    pub checkpoints_created: u64,
    pub checkpoints_evicted: u64,
    pub checkpoints_released: u64,
    pub rollback_attempts: u64,
    pub rollback_successes: u64,
    pub rollback_failures: u64,
    pub automatic_rollbacks: u64,
    pub manual_rollbacks: u64,
    pub compensation_failures: u64,
}

impl RollbackStats {
    /// Fraction of rollbacks that succeeded (1.0 when none were attempted)
    pub fn success_rate(&self) -> f64 {
        if self.rollback_attempts == 0 {
            return 1.0;
        }
        self.rollback_successes as f64 / self.rollback_attempts as f64
    }
}

/// Checkpoint manager
pub struct CheckpointManager {
    /// Stack of checkpoints, oldest first
    stack: Mutex<Vec<OperationCheckpoint>>,

    /// One accessor per concrete scope
    accessors: RwLock<HashMap<RollbackScope, Arc<dyn StateAccessor>>>,

    /// Stack bound
    max_checkpoints: usize,

    next_sequence: AtomicU64,

    stats: Mutex<RollbackStats>,
}

impl CheckpointManager {
    /// Create an empty manager holding at most `max_checkpoints` entries
    pub fn new(max_checkpoints: usize) -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            accessors: RwLock::new(HashMap::new()),
            max_checkpoints: max_checkpoints.max(1),
            next_sequence: AtomicU64::new(0),
            stats: Mutex::new(RollbackStats::default()),
        }
    }

    /// Register the accessor that owns state for `scope`
    ///
    /// `SystemWide` cannot be registered directly; it is composed from the
    /// concrete scopes.
    pub fn register_accessor(
        &self,
        scope: RollbackScope,
        accessor: Arc<dyn StateAccessor>,
    ) -> OpguardResult<()> {
        if scope == RollbackScope::SystemWide {
            return Err(OpguardError::Config(
                "system-wide scope is composed from the concrete scopes".to_string(),
            ));
        }
        self.accessors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scope, accessor);
        tracing::debug!(scope = %scope, "State accessor registered");
        Ok(())
    }

    /// Whether a checkpoint in `scope` can be taken
    pub fn has_accessor(&self, scope: RollbackScope) -> bool {
        let accessors = self.accessors.read().unwrap_or_else(|e| e.into_inner());
        match scope {
            RollbackScope::SystemWide => !accessors.is_empty(),
            concrete => accessors.contains_key(&concrete),
        }
    }

    /// Snapshot the state for `scope` and push a new checkpoint
    ///
    /// When the stack is full the oldest checkpoint is evicted.
    pub fn create_checkpoint(
        &self,
        operation_id: &str,
        scope: RollbackScope,
        description: impl Into<String>,
    ) -> OpguardResult<String> {
        let state = self.capture(scope)?;

        let mut checkpoint = OperationCheckpoint {
            id: Uuid::new_v4().to_string(),
            operation_id: operation_id.to_string(),
            description: description.into(),
            scope,
            state,
            compensating_actions: Vec::new(),
            created_at: Utc::now(),
            sequence: 0,
        };
        let id = checkpoint.id.clone();

        let evicted = {
            let mut stack = self.lock_stack();
            let mut evicted = 0u64;
            while stack.len() >= self.max_checkpoints {
                let old = stack.remove(0);
                tracing::warn!(
                    checkpoint_id = %old.id,
                    operation_id = %old.operation_id,
                    "Checkpoint stack full, evicting oldest checkpoint"
                );
                evicted += 1;
            }
            checkpoint.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            stack.push(checkpoint);
            evicted
        };

        {
            let mut stats = self.lock_stats();
            stats.checkpoints_created += 1;
            stats.checkpoints_evicted += evicted;
        }

        tracing::debug!(
            checkpoint_id = %id,
            operation_id = operation_id,
            scope = %scope,
            "Checkpoint created"
        );

        Ok(id)
    }

    /// Attach an undo step to an existing checkpoint
    pub fn add_compensating_action(
        &self,
        checkpoint_id: &str,
        action: CompensatingAction,
    ) -> OpguardResult<()> {
        let mut stack = self.lock_stack();
        let checkpoint = stack
            .iter_mut()
            .find(|cp| cp.id == checkpoint_id)
            .ok_or_else(|| OpguardError::CheckpointNotFound(checkpoint_id.to_string()))?;
        checkpoint.compensating_actions.push(action);
        Ok(())
    }

    /// Manually roll back to `checkpoint_id`
    pub fn rollback_to(&self, checkpoint_id: &str, reason: &str) -> OpguardResult<()> {
        self.rollback(checkpoint_id, reason, RollbackKind::Manual)
    }

    /// Restore the snapshot of `checkpoint_id` and discard it and every
    /// checkpoint created after it
    ///
    /// On failure the stack is left untouched.
    pub fn rollback(
        &self,
        checkpoint_id: &str,
        reason: &str,
        kind: RollbackKind,
    ) -> OpguardResult<()> {
        let start = Instant::now();
        {
            let mut stats = self.lock_stats();
            stats.rollback_attempts += 1;
            match kind {
                RollbackKind::Manual => stats.manual_rollbacks += 1,
                RollbackKind::Automatic => stats.automatic_rollbacks += 1,
            }
        }

        // Restore and compensation call out to foreign code, so they run on a
        // copy with the stack unlocked
        let checkpoint = {
            let stack = self.lock_stack();
            stack.iter().find(|cp| cp.id == checkpoint_id).cloned()
        };
        let Some(checkpoint) = checkpoint else {
            self.lock_stats().rollback_failures += 1;
            tracing::warn!(checkpoint_id = checkpoint_id, "Rollback to unknown checkpoint");
            return Err(OpguardError::CheckpointNotFound(checkpoint_id.to_string()));
        };

        if let Err(e) = self.restore(checkpoint.scope, &checkpoint.state) {
            self.lock_stats().rollback_failures += 1;
            tracing::error!(
                checkpoint_id = checkpoint_id,
                scope = %checkpoint.scope,
                error = %e,
                "Rollback failed while restoring state"
            );
            return Err(OpguardError::RollbackFailed {
                checkpoint_id: checkpoint_id.to_string(),
                message: format!("{:#}", e),
            });
        }

        let mut compensation_failures = 0u64;
        for action in checkpoint.compensating_actions.iter().rev() {
            if let Err(e) = action.run() {
                compensation_failures += 1;
                tracing::warn!(
                    checkpoint_id = checkpoint_id,
                    action = %action.description,
                    error = %e,
                    "Compensating action failed"
                );
            }
        }

        // The stack may have changed meanwhile; discard by creation order
        let discarded = {
            let mut stack = self.lock_stack();
            let before = stack.len();
            stack.retain(|cp| cp.sequence < checkpoint.sequence);
            before - stack.len()
        };
        let operation_id = checkpoint.operation_id;

        {
            let mut stats = self.lock_stats();
            stats.rollback_successes += 1;
            stats.compensation_failures += compensation_failures;
        }

        tracing::info!(
            checkpoint_id = checkpoint_id,
            operation_id = %operation_id,
            reason = reason,
            kind = ?kind,
            discarded,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Rolled back to checkpoint"
        );

        Ok(())
    }

    /// Run `block` inside a checkpoint
    ///
    /// The checkpoint is released when the block succeeds. When it fails and
    /// `auto_rollback` is set, state is rolled back before the original error
    /// is returned; a rollback failure is logged but never replaces it.
    pub async fn with_transaction<T, F, Fut>(
        &self,
        operation_id: &str,
        scope: RollbackScope,
        auto_rollback: bool,
        block: F,
    ) -> OpguardResult<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let checkpoint_id = self.create_checkpoint(operation_id, scope, "transaction")?;

        match block(checkpoint_id.clone()).await {
            Ok(value) => {
                self.release_checkpoint(&checkpoint_id);
                Ok(value)
            }
            Err(error) => {
                if auto_rollback {
                    let reason = format!("transaction failed: {}", error);
                    if let Err(rollback_error) =
                        self.rollback(&checkpoint_id, &reason, RollbackKind::Automatic)
                    {
                        tracing::error!(
                            operation_id = operation_id,
                            error = %rollback_error,
                            "Automatic transaction rollback failed"
                        );
                    }
                } else {
                    self.release_checkpoint(&checkpoint_id);
                }
                Err(OpguardError::from(error))
            }
        }
    }

    /// Drop a checkpoint without restoring it; returns false if unknown
    pub fn release_checkpoint(&self, checkpoint_id: &str) -> bool {
        let mut stack = self.lock_stack();
        let Some(index) = stack.iter().position(|cp| cp.id == checkpoint_id) else {
            return false;
        };
        stack.remove(index);
        drop(stack);
        self.lock_stats().checkpoints_released += 1;
        true
    }

    /// Remove every checkpoint owned by `operation_id`
    pub fn clear_operation(&self, operation_id: &str) -> usize {
        let mut stack = self.lock_stack();
        let before = stack.len();
        stack.retain(|cp| cp.operation_id != operation_id);
        let removed = before - stack.len();
        drop(stack);
        self.lock_stats().checkpoints_released += removed as u64;
        removed
    }

    /// Most recent checkpoint created by `operation_id`
    pub fn latest_for_operation(&self, operation_id: &str) -> Option<String> {
        self.lock_stack()
            .iter()
            .rev()
            .find(|cp| cp.operation_id == operation_id)
            .map(|cp| cp.id.clone())
    }

    /// Full checkpoint by id
    pub fn get(&self, checkpoint_id: &str) -> Option<OperationCheckpoint> {
        self.lock_stack()
            .iter()
            .find(|cp| cp.id == checkpoint_id)
            .cloned()
    }

    /// Summaries of all checkpoints, oldest first
    pub fn checkpoints(&self) -> Vec<CheckpointSummary> {
        self.lock_stack().iter().map(CheckpointSummary::from).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_stack().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only copy of the rollback statistics
    pub fn stats(&self) -> RollbackStats {
        self.lock_stats().clone()
    }

    /// Accessors owning `scope`, cloned out so no lock is held while they run
    fn accessors_for(&self, scope: RollbackScope) -> Vec<(RollbackScope, Arc<dyn StateAccessor>)> {
        let accessors = self.accessors.read().unwrap_or_else(|e| e.into_inner());
        let owned = |concrete: RollbackScope| {
            accessors
                .get(&concrete)
                .map(|accessor| (concrete, Arc::clone(accessor)))
        };
        match scope {
            RollbackScope::SystemWide => RollbackScope::CONCRETE
                .into_iter()
                .filter_map(owned)
                .collect(),
            concrete => owned(concrete).into_iter().collect(),
        }
    }

    fn capture(&self, scope: RollbackScope) -> OpguardResult<Snapshot> {
        let accessors = self.accessors_for(scope);

        let read = |scope: RollbackScope, accessor: &Arc<dyn StateAccessor>| {
            accessor.read().map_err(|e| {
                OpguardError::Action(e.context(format!("failed to snapshot {} state", scope)))
            })
        };

        match scope {
            RollbackScope::SystemWide => {
                if accessors.is_empty() {
                    return Err(OpguardError::MissingStateAccessor(scope));
                }
                let mut combined = serde_json::Map::new();
                for (concrete, accessor) in &accessors {
                    combined.insert(concrete.as_str().to_string(), read(*concrete, accessor)?);
                }
                Ok(Snapshot::Object(combined))
            }
            concrete => {
                let (_, accessor) = accessors
                    .first()
                    .ok_or(OpguardError::MissingStateAccessor(concrete))?;
                read(concrete, accessor)
            }
        }
    }

    fn restore(&self, scope: RollbackScope, snapshot: &Snapshot) -> anyhow::Result<()> {
        let accessors = self.accessors_for(scope);

        match scope {
            RollbackScope::SystemWide => {
                let parts = snapshot
                    .as_object()
                    .ok_or_else(|| anyhow::anyhow!("system-wide snapshot is not an object"))?;
                for (concrete, accessor) in &accessors {
                    if let Some(part) = parts.get(concrete.as_str()) {
                        accessor.write(part.clone())?;
                    }
                }
                Ok(())
            }
            concrete => {
                let (_, accessor) = accessors
                    .first()
                    .ok_or_else(|| anyhow::anyhow!("no state accessor for {}", concrete))?;
                accessor.write(snapshot.clone())
            }
        }
    }

    fn lock_stack(&self) -> std::sync::MutexGuard<'_, Vec<OperationCheckpoint>> {
        self.stack.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, RollbackStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHECKPOINTS)
    }
}
