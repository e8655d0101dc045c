/// Operation orchestrator
///
/// Owns the progress record and cancellation token of every in-flight
/// operation. Finished operations move to a bounded history ring. Timeouts
/// are deferred tasks that cancel the operation with `CancelReason::Timeout`
/// and are aborted when the operation finishes first.
use super::progress::{OperationProgress, OperationState, ProgressUpdate};
use super::token::{CancelReason, CancellationToken};
use crate::notification::NotificationHub;
use crate::{OpguardError, OpguardResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Default size of the finished-operation history
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Which operations a cancel request reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationScope {
    /// Only the named operation
    Operation,

    /// The operation and every descendant
    OperationAndChildren,

    /// Every active operation sharing an agent with the named one
    SharedAgent,

    /// Every active operation with the same request id
    SharedRequest,

    /// Every active operation
    AllActive,
}

/// Options for [`OperationOrchestrator::start_operation_with`]
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub total_steps: Option<u32>,
    pub parent_id: Option<String>,
    pub agents: Vec<String>,

    /// Overrides the orchestrator's default timeout
    pub timeout: Option<Duration>,
}

/// Result of a cancel request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelReport {
    /// Operations the scope resolved to
    pub targets: Vec<String>,

    /// Operations whose token this request flipped
    pub cancelled: Vec<String>,

    /// Targets that were already cancelled or finished
    pub skipped: Vec<String>,
}

impl CancelReport {
    pub fn cancelled_any(&self) -> bool {
        !self.cancelled.is_empty()
    }
}

/// Orchestrator counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub active: usize,
    pub history_len: usize,
    pub cancellations_by_reason: HashMap<CancelReason, u64>,
}

struct Entry {
    progress: OperationProgress,
    timeout: Option<AbortHandle>,
}

/// Cancellation and progress orchestrator
pub struct OperationOrchestrator {
    /// Active operations by id
    active: Mutex<HashMap<String, Entry>>,

    /// Finished operations, oldest first
    history: Mutex<VecDeque<OperationProgress>>,

    history_limit: usize,

    default_timeout: Option<Duration>,

    notifications: Arc<NotificationHub>,

    stats: Mutex<OrchestratorStats>,

    /// Handle to ourselves for deferred timeout tasks
    this: Weak<OperationOrchestrator>,
}

impl OperationOrchestrator {
    pub fn new(
        history_limit: usize,
        default_timeout: Option<Duration>,
        notifications: Arc<NotificationHub>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            default_timeout,
            notifications,
            stats: Mutex::new(OrchestratorStats::default()),
            this: this.clone(),
        })
    }

    /// Orchestrator with default limits and no sinks
    pub fn standalone() -> Arc<Self> {
        Self::new(
            DEFAULT_HISTORY_LIMIT,
            None,
            Arc::new(NotificationHub::default()),
        )
    }

    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.notifications
    }

    /// Register a new operation and return its fresh token
    pub fn start_operation(
        &self,
        operation_id: &str,
        request_id: &str,
        total_steps: Option<u32>,
    ) -> OpguardResult<CancellationToken> {
        self.start_operation_with(
            operation_id,
            request_id,
            StartOptions {
                total_steps,
                ..StartOptions::default()
            },
        )
    }

    pub fn start_operation_with(
        &self,
        operation_id: &str,
        request_id: &str,
        options: StartOptions,
    ) -> OpguardResult<CancellationToken> {
        let mut progress = OperationProgress::new(operation_id, request_id, options.total_steps);
        progress.parent_id = options.parent_id.clone();
        if !options.agents.is_empty() {
            progress.apply(&ProgressUpdate::new().active_agents(options.agents.iter().cloned()));
        }
        let token = progress.token.clone();

        let parent_cancelled = {
            let mut active = self.lock_active();
            if active.contains_key(operation_id) {
                return Err(OpguardError::OperationExists(operation_id.to_string()));
            }
            let parent_cancelled = options
                .parent_id
                .as_deref()
                .and_then(|parent| active.get(parent))
                .map(|parent| parent.progress.token.is_cancelled());

            active.insert(
                operation_id.to_string(),
                Entry {
                    progress: progress.clone(),
                    timeout: None,
                },
            );
            parent_cancelled
        };
        // Cancelled parents leave the active map at once; look them up in history
        let parent_cancelled = match (parent_cancelled, options.parent_id.as_deref()) {
            (Some(cancelled), _) => cancelled,
            (None, Some(parent)) => self.finished_as_cancelled(parent),
            (None, None) => false,
        };

        self.lock_stats().started += 1;
        tracing::info!(
            operation_id = operation_id,
            request_id = request_id,
            parent_id = ?options.parent_id,
            "Operation started"
        );
        self.notifications.progress(&progress);

        if parent_cancelled {
            self.cancel_targets(
                vec![operation_id.to_string()],
                CancelReason::ParentCancelled,
                "parent operation already cancelled",
            );
            return Ok(token);
        }

        if let Some(after) = options.timeout.or(self.default_timeout) {
            self.schedule_timeout(operation_id, after);
        }

        Ok(token)
    }

    /// Merge a progress update into an active operation
    ///
    /// Updates are applied in submission order under the operation map lock.
    pub fn update_progress(
        &self,
        operation_id: &str,
        update: ProgressUpdate,
    ) -> OpguardResult<OperationProgress> {
        let snapshot = {
            let mut active = self.lock_active();
            let Some(entry) = active.get_mut(operation_id) else {
                return Err(self.missing(operation_id));
            };

            if let Some(next) = update.state.filter(|s| s.is_terminal()) {
                return Err(OpguardError::InvalidTransition {
                    operation_id: operation_id.to_string(),
                    from: entry.progress.state,
                    to: next,
                });
            }

            entry.progress.apply(&update);
            entry.progress.clone()
        };

        tracing::debug!(
            operation_id = operation_id,
            state = %snapshot.state,
            percentage = snapshot.percentage,
            step = %snapshot.current_step,
            "Progress updated"
        );
        self.notifications.progress(&snapshot);
        Ok(snapshot)
    }

    /// Count a retry against an active operation
    pub fn record_retry(&self, operation_id: &str) -> bool {
        self.with_entry(operation_id, |p| p.retry_count += 1)
    }

    /// Count an error against an active operation
    pub fn record_error(&self, operation_id: &str) -> bool {
        self.with_entry(operation_id, |p| p.error_count += 1)
    }

    /// Cancel the operations `scope` resolves to from `operation_id`
    ///
    /// Tokens that were already cancelled are skipped, so repeating a
    /// request cancels nothing the second time.
    pub fn cancel(
        &self,
        operation_id: &str,
        reason: CancelReason,
        message: &str,
        scope: CancellationScope,
    ) -> OpguardResult<CancelReport> {
        let resolved = {
            let active = self.lock_active();
            match active.get(operation_id) {
                Some(root) => Some(resolve_targets(&active, root, scope)),
                None if scope == CancellationScope::AllActive => {
                    Some(active.keys().cloned().collect())
                }
                None => None,
            }
        };

        let Some(targets) = resolved else {
            if self.in_history(operation_id) {
                return Ok(CancelReport {
                    targets: vec![operation_id.to_string()],
                    cancelled: Vec::new(),
                    skipped: vec![operation_id.to_string()],
                });
            }
            return Err(OpguardError::OperationNotFound(operation_id.to_string()));
        };

        tracing::info!(
            operation_id = operation_id,
            reason = %reason,
            scope = ?scope,
            targets = targets.len(),
            "Cancellation requested"
        );

        let (root, descendants): (Vec<_>, Vec<_>) = targets
            .into_iter()
            .partition(|id| id == operation_id || scope != CancellationScope::OperationAndChildren);

        let mut report = self.cancel_targets(root, reason, message);
        if !descendants.is_empty() {
            let children = self.cancel_targets(
                descendants,
                CancelReason::ParentCancelled,
                &format!("parent {} cancelled: {}", operation_id, message),
            );
            report.targets.extend(children.targets);
            report.cancelled.extend(children.cancelled);
            report.skipped.extend(children.skipped);
        }
        Ok(report)
    }

    /// Cancel a single operation; false if it was not cancelled by this call
    pub fn cancel_operation(&self, operation_id: &str, reason: CancelReason, message: &str) -> bool {
        self.cancel(operation_id, reason, message, CancellationScope::Operation)
            .map(|report| report.cancelled_any())
            .unwrap_or(false)
    }

    /// Mark an operation as completed
    pub fn complete_operation(&self, operation_id: &str) -> OpguardResult<OperationProgress> {
        let progress = self.finish(operation_id, OperationState::Completed, None)?;
        self.lock_stats().completed += 1;
        tracing::info!(
            operation_id = operation_id,
            elapsed_ms = progress.elapsed().as_millis() as u64,
            retries = progress.retry_count,
            "Operation completed"
        );
        Ok(progress)
    }

    /// Mark an operation as failed
    pub fn fail_operation(
        &self,
        operation_id: &str,
        message: impl Into<String>,
    ) -> OpguardResult<OperationProgress> {
        let message = message.into();
        let progress = self.finish(operation_id, OperationState::Error, Some(message.clone()))?;
        self.lock_stats().failed += 1;
        tracing::warn!(
            operation_id = operation_id,
            error = %message,
            errors = progress.error_count,
            "Operation failed"
        );
        Ok(progress)
    }

    /// Cancel `operation_id` with `CancelReason::Timeout` after `after`
    ///
    /// Replaces any earlier timeout of the operation. Returns false if the
    /// operation is not active or no runtime is available.
    pub fn schedule_timeout(&self, operation_id: &str, after: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(operation_id = operation_id, "No runtime, timeout not scheduled");
            return false;
        };

        let mut active = self.lock_active();
        let Some(entry) = active.get_mut(operation_id) else {
            return false;
        };

        let this = self.this.clone();
        let id = operation_id.to_string();
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(orchestrator) = this.upgrade() {
                let message = format!("timed out after {}", humantime::format_duration(after));
                tracing::warn!(operation_id = %id, timeout_ms = after.as_millis() as u64, "Operation timed out");
                let _ = orchestrator.cancel(
                    &id,
                    CancelReason::Timeout,
                    &message,
                    CancellationScope::OperationAndChildren,
                );
            }
        });

        if let Some(previous) = entry.timeout.replace(task.abort_handle()) {
            previous.abort();
        }
        true
    }

    /// Run `fut` until it finishes or the operation is cancelled
    pub async fn run_cancellable<F>(&self, operation_id: &str, fut: F) -> OpguardResult<F::Output>
    where
        F: Future,
    {
        let token = self
            .token(operation_id)
            .ok_or_else(|| self.missing(operation_id))?;
        token.run_until_cancelled(fut).await
    }

    /// Token of an active operation
    pub fn token(&self, operation_id: &str) -> Option<CancellationToken> {
        self.lock_active()
            .get(operation_id)
            .map(|entry| entry.progress.token.clone())
    }

    /// Progress of an active or recently finished operation
    pub fn get_progress(&self, operation_id: &str) -> Option<OperationProgress> {
        if let Some(entry) = self.lock_active().get(operation_id) {
            return Some(entry.progress.clone());
        }
        self.lock_history()
            .iter()
            .rev()
            .find(|p| p.operation_id == operation_id)
            .cloned()
    }

    pub fn is_active(&self, operation_id: &str) -> bool {
        self.lock_active().contains_key(operation_id)
    }

    /// Active operations, oldest first
    pub fn active_operations(&self) -> Vec<OperationProgress> {
        let mut operations: Vec<_> = self
            .lock_active()
            .values()
            .map(|entry| entry.progress.clone())
            .collect();
        operations.sort_by_key(|p| p.started_at);
        operations
    }

    /// Finished operations, oldest first
    pub fn history(&self) -> Vec<OperationProgress> {
        self.lock_history().iter().cloned().collect()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let mut stats = self.lock_stats().clone();
        stats.active = self.lock_active().len();
        stats.history_len = self.lock_history().len();
        stats
    }

    /// Cancel every active operation with `CancelReason::SystemShutdown`
    pub fn shutdown(&self) -> usize {
        let targets: Vec<String> = self.lock_active().keys().cloned().collect();
        if targets.is_empty() {
            return 0;
        }
        tracing::info!(active = targets.len(), "Shutting down orchestrator");
        self.cancel_targets(targets, CancelReason::SystemShutdown, "system shutdown")
            .cancelled
            .len()
    }

    /// Flip tokens outside the map lock (callbacks may call back into the
    /// orchestrator), then retire the operations that were flipped
    fn cancel_targets(&self, targets: Vec<String>, reason: CancelReason, message: &str) -> CancelReport {
        let tokens: Vec<(String, Option<CancellationToken>)> = {
            let active = self.lock_active();
            targets
                .iter()
                .map(|id| (id.clone(), active.get(id).map(|e| e.progress.token.clone())))
                .collect()
        };

        let mut report = CancelReport {
            targets,
            ..CancelReport::default()
        };

        for (id, token) in tokens {
            match token {
                Some(token) if token.cancel(reason, message) => report.cancelled.push(id),
                _ => report.skipped.push(id),
            }
        }

        let final_state = if reason == CancelReason::Timeout {
            OperationState::Timeout
        } else {
            OperationState::Cancelled
        };

        for id in &report.cancelled {
            let Some(mut entry) = self.lock_active().remove(id) else {
                continue;
            };
            if let Some(handle) = entry.timeout.take() {
                handle.abort();
            }
            entry.progress.state = OperationState::Cancelling;
            tracing::debug!(operation_id = %id, "Operation cancelling");
            self.notifications.progress(&entry.progress);
            entry
                .progress
                .finish(final_state, Some(format!("{}: {}", reason, message)));

            {
                let mut stats = self.lock_stats();
                if final_state == OperationState::Timeout {
                    stats.timed_out += 1;
                } else {
                    stats.cancelled += 1;
                }
                *stats.cancellations_by_reason.entry(reason).or_insert(0) += 1;
            }

            tracing::info!(operation_id = %id, reason = %reason, state = %final_state, "Operation cancelled");
            self.notifications.progress(&entry.progress);
            self.push_history(entry.progress);
        }

        report
    }

    fn finish(
        &self,
        operation_id: &str,
        state: OperationState,
        message: Option<String>,
    ) -> OpguardResult<OperationProgress> {
        let mut entry = self
            .lock_active()
            .remove(operation_id)
            .ok_or_else(|| self.missing(operation_id))?;

        if let Some(handle) = entry.timeout.take() {
            handle.abort();
        }
        entry.progress.finish(state, message);
        let progress = entry.progress;

        self.notifications.progress(&progress);
        self.push_history(progress.clone());
        Ok(progress)
    }

    fn with_entry<F>(&self, operation_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut OperationProgress),
    {
        match self.lock_active().get_mut(operation_id) {
            Some(entry) => {
                f(&mut entry.progress);
                true
            }
            None => false,
        }
    }

    fn push_history(&self, progress: OperationProgress) {
        let mut history = self.lock_history();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(progress);
    }

    fn finished_as_cancelled(&self, operation_id: &str) -> bool {
        self.lock_history()
            .iter()
            .rev()
            .find(|p| p.operation_id == operation_id)
            .map(|p| matches!(p.state, OperationState::Cancelled | OperationState::Timeout))
            .unwrap_or(false)
    }

    fn in_history(&self, operation_id: &str) -> bool {
        self.lock_history()
            .iter()
            .any(|p| p.operation_id == operation_id)
    }

    fn missing(&self, operation_id: &str) -> OpguardError {
        if self.in_history(operation_id) {
            OpguardError::OperationNotActive(operation_id.to_string())
        } else {
            OpguardError::OperationNotFound(operation_id.to_string())
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<OperationProgress>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, OrchestratorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Operation ids reached by `scope`, root first
fn resolve_targets(
    active: &HashMap<String, Entry>,
    root: &Entry,
    scope: CancellationScope,
) -> Vec<String> {
    let root_id = root.progress.operation_id.clone();
    let mut targets = vec![root_id.clone()];

    match scope {
        CancellationScope::Operation => {}
        CancellationScope::OperationAndChildren => {
            // Walk parent links down from the root
            let mut frontier = vec![root_id];
            while let Some(parent) = frontier.pop() {
                for (id, entry) in active {
                    if entry.progress.parent_id.as_deref() == Some(parent.as_str())
                        && !targets.contains(id)
                    {
                        targets.push(id.clone());
                        frontier.push(id.clone());
                    }
                }
            }
        }
        CancellationScope::SharedAgent => {
            let agents: &BTreeSet<String> = &root.progress.involved_agents;
            targets.extend(
                active
                    .iter()
                    .filter(|(id, entry)| {
                        **id != root_id && !entry.progress.involved_agents.is_disjoint(agents)
                    })
                    .map(|(id, _)| id.clone()),
            );
        }
        CancellationScope::SharedRequest => {
            targets.extend(
                active
                    .iter()
                    .filter(|(id, entry)| {
                        **id != root_id && entry.progress.request_id == root.progress.request_id
                    })
                    .map(|(id, _)| id.clone()),
            );
        }
        CancellationScope::AllActive => {
            targets.extend(active.keys().filter(|id| **id != root_id).cloned());
        }
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::ChannelSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn orchestrator() -> Arc<OperationOrchestrator> {
        OperationOrchestrator::standalone()
    }

    #[test]
    fn test_start_creates_fresh_token() {
        let orch = orchestrator();
        let token = orch.start_operation("op-1", "req-1", Some(3)).unwrap();
        assert_eq!(token.operation_id(), "op-1");
        assert!(!token.is_cancelled());

        let progress = orch.get_progress("op-1").unwrap();
        assert_eq!(progress.state, OperationState::Queued);
        assert_eq!(progress.total_steps, Some(3));
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let orch = orchestrator();
        orch.start_operation("op-1", "req-1", None).unwrap();
        assert!(matches!(
            orch.start_operation("op-1", "req-1", None),
            Err(OpguardError::OperationExists(_))
        ));
    }

    #[test]
    fn test_update_progress_merges() {
        let orch = orchestrator();
        orch.start_operation("op-1", "req-1", None).unwrap();

        orch.update_progress(
            "op-1",
            ProgressUpdate::new()
                .state(OperationState::Running)
                .percentage(50.0),
        )
        .unwrap();
        let progress = orch
            .update_progress("op-1", ProgressUpdate::new().percentage(20.0))
            .unwrap();

        assert_eq!(progress.state, OperationState::Running);
        assert_eq!(progress.percentage, 50.0);
    }

    #[test]
    fn test_update_to_terminal_state_rejected() {
        let orch = orchestrator();
        orch.start_operation("op-1", "req-1", None).unwrap();
        let result = orch.update_progress("op-1", ProgressUpdate::new().state(OperationState::Completed));
        assert!(matches!(result, Err(OpguardError::InvalidTransition { .. })));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let orch = orchestrator();
        let token = orch.start_operation("op-1", "req-1", None).unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(orch.cancel_operation("op-1", CancelReason::UserRequested, "stop"));
        assert!(!orch.cancel_operation("op-1", CancelReason::UserRequested, "stop"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let progress = orch.get_progress("op-1").unwrap();
        assert_eq!(progress.state, OperationState::Cancelled);
        assert!(!orch.is_active("op-1"));
    }

    #[test]
    fn test_cancel_unknown_operation() {
        let orch = orchestrator();
        assert!(matches!(
            orch.cancel("nope", CancelReason::UserRequested, "x", CancellationScope::Operation),
            Err(OpguardError::OperationNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_with_children() {
        let orch = orchestrator();
        orch.start_operation("parent", "req", None).unwrap();
        let child = orch
            .start_operation_with(
                "child",
                "req",
                StartOptions {
                    parent_id: Some("parent".into()),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        let grandchild = orch
            .start_operation_with(
                "grandchild",
                "req",
                StartOptions {
                    parent_id: Some("child".into()),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        orch.start_operation("unrelated", "req", None).unwrap();

        let report = orch
            .cancel(
                "parent",
                CancelReason::UserRequested,
                "stop",
                CancellationScope::OperationAndChildren,
            )
            .unwrap();

        assert_eq!(report.cancelled.len(), 3);
        assert_eq!(child.reason(), Some(CancelReason::ParentCancelled));
        assert!(grandchild.is_cancelled());
        assert!(orch.is_active("unrelated"));
    }

    #[test]
    fn test_cancel_shared_agent_and_request() {
        let orch = orchestrator();
        let start = |id: &str, req: &str, agents: &[&str]| {
            orch.start_operation_with(
                id,
                req,
                StartOptions {
                    agents: agents.iter().map(|a| a.to_string()).collect(),
                    ..StartOptions::default()
                },
            )
            .unwrap()
        };
        start("a", "r1", &["writer"]);
        let b = start("b", "r2", &["writer", "analyst"]);
        let c = start("c", "r2", &["charts"]);

        let report = orch
            .cancel("a", CancelReason::ResourceLimit, "writer overloaded", CancellationScope::SharedAgent)
            .unwrap();
        assert_eq!(report.cancelled.len(), 2);
        assert!(b.is_cancelled());
        assert!(!c.is_cancelled());

        orch.start_operation("d", "r2", None).unwrap();
        let report = orch
            .cancel("c", CancelReason::Superseded, "new request", CancellationScope::SharedRequest)
            .unwrap();
        assert_eq!(report.cancelled.len(), 2);
        assert!(orch.active_operations().is_empty());
    }

    #[test]
    fn test_complete_and_fail() {
        let orch = orchestrator();
        orch.start_operation("ok", "req", None).unwrap();
        orch.start_operation("bad", "req", None).unwrap();
        orch.record_retry("bad");
        orch.record_error("bad");

        let done = orch.complete_operation("ok").unwrap();
        assert_eq!(done.state, OperationState::Completed);
        assert_eq!(done.percentage, 100.0);

        let failed = orch.fail_operation("bad", "upstream 500").unwrap();
        assert_eq!(failed.state, OperationState::Error);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.message.as_deref(), Some("upstream 500"));

        assert!(matches!(
            orch.complete_operation("ok"),
            Err(OpguardError::OperationNotActive(_))
        ));

        let stats = orch.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.history_len, 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let orch = OperationOrchestrator::new(3, None, Arc::new(NotificationHub::default()));
        for n in 0..5 {
            let id = format!("op-{}", n);
            orch.start_operation(&id, "req", None).unwrap();
            orch.complete_operation(&id).unwrap();
        }
        let history = orch.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].operation_id, "op-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_operation() {
        let orch = orchestrator();
        let token = orch
            .start_operation_with(
                "slow",
                "req",
                StartOptions {
                    timeout: Some(Duration::from_secs(2)),
                    ..StartOptions::default()
                },
            )
            .unwrap();

        token.cancelled().await;
        assert_eq!(token.reason(), Some(CancelReason::Timeout));

        // Let the timeout task finish retiring the operation
        tokio::task::yield_now().await;
        let progress = orch.get_progress("slow").unwrap();
        assert_eq!(progress.state, OperationState::Timeout);
        assert_eq!(orch.stats().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborted_on_completion() {
        let orch = orchestrator();
        let token = orch
            .start_operation_with(
                "fast",
                "req",
                StartOptions {
                    timeout: Some(Duration::from_secs(2)),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        orch.complete_operation("fast").unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!token.is_cancelled());
        assert_eq!(orch.get_progress("fast").unwrap().state, OperationState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cancellable() {
        let orch = orchestrator();
        orch.start_operation("op", "req", None).unwrap();

        let canceller = Arc::clone(&orch);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel_operation("op", CancelReason::UserRequested, "stop");
        });

        let result = orch
            .run_cancellable("op", tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let orch = orchestrator();
        let tokens: Vec<_> = (0..3)
            .map(|n| orch.start_operation(&format!("op-{}", n), "req", None).unwrap())
            .collect();

        assert_eq!(orch.shutdown(), 3);
        assert!(tokens
            .iter()
            .all(|t| t.reason() == Some(CancelReason::SystemShutdown)));
        assert_eq!(orch.shutdown(), 0);
        assert_eq!(
            orch.stats().cancellations_by_reason.get(&CancelReason::SystemShutdown),
            Some(&3)
        );
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let orch = orchestrator();
        let parent = orch.start_operation("parent", "req", None).unwrap();
        // Cancel the token directly so the parent stays registered
        parent.cancel(CancelReason::UserRequested, "stop");

        let child = orch
            .start_operation_with(
                "child",
                "req",
                StartOptions {
                    parent_id: Some("parent".into()),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        assert_eq!(child.reason(), Some(CancelReason::ParentCancelled));
    }

    #[test]
    fn test_child_of_parent_cancelled_through_orchestrator_starts_cancelled() {
        let orch = orchestrator();
        orch.start_operation("parent", "req", None).unwrap();
        orch.cancel(
            "parent",
            CancelReason::UserRequested,
            "stop",
            CancellationScope::OperationAndChildren,
        )
        .unwrap();
        assert!(!orch.is_active("parent"));

        let child = orch
            .start_operation_with(
                "child",
                "req",
                StartOptions {
                    parent_id: Some("parent".into()),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some(CancelReason::ParentCancelled));
        assert_eq!(
            orch.get_progress("child").unwrap().state,
            OperationState::Cancelled
        );
    }

    #[test]
    fn test_child_of_completed_parent_starts_live() {
        let orch = orchestrator();
        orch.start_operation("parent", "req", None).unwrap();
        orch.complete_operation("parent").unwrap();

        let child = orch
            .start_operation_with(
                "child",
                "req",
                StartOptions {
                    parent_id: Some("parent".into()),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        assert!(!child.is_cancelled());
        assert!(orch.is_active("child"));
    }

    #[tokio::test]
    async fn test_progress_notifications() {
        let (sink, mut rx) = ChannelSink::new(16);
        let hub = Arc::new(NotificationHub::default());
        hub.register(Arc::new(sink));
        let orch = OperationOrchestrator::new(10, None, hub);

        orch.start_operation("op", "req", None).unwrap();
        orch.update_progress("op", ProgressUpdate::new().percentage(10.0))
            .unwrap();
        orch.complete_operation("op").unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::notification::Notification::Progress(p) = event {
                states.push(p.state);
            }
        }
        assert_eq!(
            states,
            vec![
                OperationState::Queued,
                OperationState::Queued,
                OperationState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_notifies_cancelling_then_cancelled() {
        let (sink, mut rx) = ChannelSink::new(16);
        let hub = Arc::new(NotificationHub::default());
        hub.register(Arc::new(sink));
        let orch = OperationOrchestrator::new(10, None, hub);

        orch.start_operation("op", "req", None).unwrap();
        orch.cancel(
            "op",
            CancelReason::UserRequested,
            "stop",
            CancellationScope::Operation,
        )
        .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::notification::Notification::Progress(p) = event {
                states.push(p.state);
            }
        }
        assert_eq!(
            states,
            vec![
                OperationState::Queued,
                OperationState::Cancelling,
                OperationState::Cancelled
            ]
        );
    }
}
