/// End-to-end operation supervision
///
/// Composes the orchestrator, checkpoint manager, retry engine and error
/// coordinator around one operation:
///
/// 1. start the operation (token, progress record, timeout)
/// 2. checkpoint the requested scope, if an accessor owns it
/// 3. run the action through the retry engine
/// 4. on success complete the operation and release the checkpoint
/// 5. on terminal failure hand the error to the coordinator, which may roll
///    back, then mark the operation failed
///
/// Cancelled operations are rolled back when they hold a checkpoint. Their
/// final state (`cancelled` or `timeout`) is set by the orchestrator.
use crate::cancellation::{
    OperationOrchestrator, OperationProgress, OperationState, ProgressUpdate, StartOptions,
};
use crate::checkpoint::{CheckpointManager, RollbackScope, StateAccessor};
use crate::config::OpguardConfig;
use crate::error::{ErrorContext, ErrorResponse, SqliteAuditLog, UnifiedErrorCoordinator};
use crate::notification::NotificationHub;
use crate::retry::{
    CircuitBreakerRegistry, CircuitBreakerSettings, PolicyRegistry, RetryEngine, WorkerPool,
    DEFAULT_OPERATION_TYPE,
};
use crate::{CancellationToken, OpguardError, OpguardResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// What to run and how to protect it
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation_id: String,
    pub request_id: String,

    /// Selects the retry policy
    pub operation_type: String,

    /// Selects the service circuit breaker
    pub service: String,

    /// State to checkpoint before the first attempt
    pub scope: Option<RollbackScope>,

    /// Overrides the orchestrator's default timeout
    pub timeout: Option<Duration>,

    pub total_steps: Option<u32>,
    pub parent_id: Option<String>,
    pub agents: Vec<String>,

    /// Roll back on any terminal failure, not only severe ones
    pub rollback_required: bool,

    pub privacy_sensitive: bool,
}

impl OperationRequest {
    /// Request with fresh operation and request ids
    pub fn new(operation_type: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            request_id: Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            service: service.into(),
            scope: None,
            timeout: None,
            total_steps: None,
            parent_id: None,
            agents: Vec::new(),
            rollback_required: false,
            privacy_sensitive: false,
        }
    }

    pub fn with_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = operation_id.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_scope(mut self, scope: RollbackScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_total_steps(mut self, steps: u32) -> Self {
        self.total_steps = Some(steps);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn require_rollback(mut self) -> Self {
        self.rollback_required = true;
        self
    }

    pub fn privacy_sensitive(mut self) -> Self {
        self.privacy_sensitive = true;
        self
    }
}

impl Default for OperationRequest {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TYPE, DEFAULT_OPERATION_TYPE)
    }
}

/// Terminal failure of a supervised operation
#[derive(Debug, Error)]
#[error("{error}")]
pub struct OperationFailure {
    /// Last error, as the action or the engine produced it
    pub error: OpguardError,

    /// Coordinator verdict; `None` if the operation never started
    pub response: Option<ErrorResponse>,

    /// Final progress record
    pub progress: Option<OperationProgress>,
}

impl OperationFailure {
    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }

    pub fn final_state(&self) -> Option<OperationState> {
        self.progress.as_ref().map(|p| p.state)
    }
}

/// Handed to the action on every attempt
#[derive(Clone)]
pub struct ActionContext {
    pub token: CancellationToken,

    /// 1-based attempt number
    pub attempt: u32,

    operation_id: String,
    orchestrator: Arc<OperationOrchestrator>,
}

impl ActionContext {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// `Err(Cancelled)` once the operation is cancelled
    pub fn check(&self) -> OpguardResult<()> {
        self.token.check()
    }

    /// Report progress; false once the operation is no longer active
    pub fn report(&self, update: ProgressUpdate) -> bool {
        self.orchestrator
            .update_progress(&self.operation_id, update)
            .is_ok()
    }
}

/// The four resilience components wired together
pub struct OperationSupervisor {
    orchestrator: Arc<OperationOrchestrator>,
    engine: Arc<RetryEngine>,
    checkpoints: Arc<CheckpointManager>,
    coordinator: Arc<UnifiedErrorCoordinator>,
}

impl OperationSupervisor {
    pub fn new(
        orchestrator: Arc<OperationOrchestrator>,
        engine: Arc<RetryEngine>,
        checkpoints: Arc<CheckpointManager>,
        coordinator: Arc<UnifiedErrorCoordinator>,
    ) -> Self {
        Self {
            orchestrator,
            engine,
            checkpoints,
            coordinator,
        }
    }

    /// Build every component from `config`, sharing `notifications`
    pub fn from_config(
        config: &OpguardConfig,
        notifications: Arc<NotificationHub>,
    ) -> OpguardResult<Self> {
        config.validate()?;

        let orchestrator = OperationOrchestrator::new(
            config.orchestrator.history_limit,
            config.orchestrator.default_timeout,
            Arc::clone(&notifications),
        );

        let policies = Arc::new(config.retry.build_registry()?);
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            policies.default_policy().circuit_breaker.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(config.worker_pool.effective_size()));
        let engine = Arc::new(
            RetryEngine::new(policies, breakers, pool)
                .with_attempt_log_capacity(config.retry.attempt_log_capacity),
        );

        let checkpoints = Arc::new(CheckpointManager::new(config.checkpoint.max_checkpoints));

        let mut coordinator = UnifiedErrorCoordinator::new(config.coordinator.clone())
            .with_checkpoints(Arc::clone(&checkpoints))
            .with_orchestrator(Arc::clone(&orchestrator))
            .with_notifications(notifications);
        if config.audit.enabled {
            let path = config.audit.effective_path();
            let audit = SqliteAuditLog::open(&path)?;
            tracing::info!(path = %path.display(), "Error audit log enabled");
            coordinator = coordinator.with_audit_log(Arc::new(audit));
        }

        tracing::debug!(
            workers = config.worker_pool.effective_size(),
            max_checkpoints = config.checkpoint.max_checkpoints,
            "Operation supervisor configured"
        );

        Ok(Self::new(
            orchestrator,
            engine,
            checkpoints,
            Arc::new(coordinator),
        ))
    }

    /// Supervisor with default settings, no sinks and no audit log
    pub fn standalone() -> Self {
        let notifications = Arc::new(NotificationHub::new());
        let orchestrator = OperationOrchestrator::new(
            crate::cancellation::DEFAULT_HISTORY_LIMIT,
            None,
            Arc::clone(&notifications),
        );
        let engine = Arc::new(RetryEngine::new(
            Arc::new(PolicyRegistry::with_presets()),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default())),
            Arc::new(WorkerPool::with_cpu_count()),
        ));
        let checkpoints = Arc::new(CheckpointManager::default());
        let coordinator = UnifiedErrorCoordinator::default()
            .with_checkpoints(Arc::clone(&checkpoints))
            .with_orchestrator(Arc::clone(&orchestrator))
            .with_notifications(notifications);
        Self::new(orchestrator, engine, checkpoints, Arc::new(coordinator))
    }

    pub fn orchestrator(&self) -> &Arc<OperationOrchestrator> {
        &self.orchestrator
    }

    pub fn engine(&self) -> &Arc<RetryEngine> {
        &self.engine
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn coordinator(&self) -> &Arc<UnifiedErrorCoordinator> {
        &self.coordinator
    }

    pub fn notifications(&self) -> &Arc<NotificationHub> {
        self.orchestrator.notifications()
    }

    /// Register the state owner for `scope`
    pub fn register_accessor(
        &self,
        scope: RollbackScope,
        accessor: Arc<dyn StateAccessor>,
    ) -> OpguardResult<()> {
        self.checkpoints.register_accessor(scope, accessor)
    }

    /// Run `action` as a supervised operation
    pub async fn run_operation<T, F, Fut>(
        &self,
        request: OperationRequest,
        mut action: F,
    ) -> Result<T, OperationFailure>
    where
        F: FnMut(ActionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let operation_id = request.operation_id.clone();
        let token = self
            .orchestrator
            .start_operation_with(
                &operation_id,
                &request.request_id,
                StartOptions {
                    total_steps: request.total_steps,
                    parent_id: request.parent_id.clone(),
                    agents: request.agents.clone(),
                    timeout: request.timeout,
                },
            )
            .map_err(|error| OperationFailure {
                error,
                response: None,
                progress: None,
            })?;

        let _ = self.orchestrator.update_progress(
            &operation_id,
            ProgressUpdate::new()
                .state(OperationState::Initializing)
                .step("creating checkpoint"),
        );

        let checkpoint_id = match self.checkpoint(&request) {
            Ok(id) => id,
            Err(error) => return Err(self.fail(&request, error, None, 0, token.is_cancelled())),
        };

        let _ = self.orchestrator.update_progress(
            &operation_id,
            ProgressUpdate::new()
                .state(OperationState::Running)
                .step("running"),
        );

        let mut attempts = 0u32;
        let result = self
            .engine
            .run_with_retry(
                &request.operation_type,
                &request.service,
                &token,
                |token: CancellationToken| {
                    attempts += 1;
                    if attempts > 1 {
                        self.orchestrator.record_retry(&operation_id);
                    }
                    action(ActionContext {
                        token,
                        attempt: attempts,
                        operation_id: operation_id.clone(),
                        orchestrator: Arc::clone(&self.orchestrator),
                    })
                },
            )
            .await;

        match result {
            Ok(value) => {
                if let Some(id) = &checkpoint_id {
                    self.checkpoints.release_checkpoint(id);
                }
                if let Err(e) = self.orchestrator.complete_operation(&operation_id) {
                    // Cancelled after the last attempt succeeded
                    tracing::debug!(operation_id = %operation_id, error = %e, "Operation not completed");
                }
                Ok(value)
            }
            Err(error) => {
                let cancelled = token.is_cancelled();
                Err(self.fail(&request, error, checkpoint_id, attempts, cancelled))
            }
        }
    }

    /// Cancel every active operation and stop accepting blocking work
    pub fn shutdown(&self) -> usize {
        let cancelled = self.orchestrator.shutdown();
        self.engine.pool().close();
        tracing::info!(cancelled, "Operation supervisor shut down");
        cancelled
    }

    fn checkpoint(&self, request: &OperationRequest) -> OpguardResult<Option<String>> {
        let Some(scope) = request.scope else {
            return Ok(None);
        };
        if !self.checkpoints.has_accessor(scope) {
            tracing::warn!(
                operation_id = %request.operation_id,
                scope = %scope,
                "No state accessor for scope, running without checkpoint"
            );
            return Ok(None);
        }
        let description = format!("before {} on {}", request.operation_type, request.service);
        self.checkpoints
            .create_checkpoint(&request.operation_id, scope, description)
            .map(Some)
    }

    fn fail(
        &self,
        request: &OperationRequest,
        error: OpguardError,
        checkpoint_id: Option<String>,
        attempts: u32,
        cancelled: bool,
    ) -> OperationFailure {
        let operation_id = &request.operation_id;
        self.orchestrator.record_error(operation_id);

        // A cancellation raised by some other token is this operation's failure
        let error = if error.is_cancelled() && !cancelled {
            OpguardError::Action(anyhow::Error::new(error))
        } else {
            error
        };
        let max_attempts = self
            .engine
            .policies()
            .get(&request.operation_type)
            .max_attempts;

        let mut context = ErrorContext::for_operation(operation_id.as_str())
            .with_operation_type(request.operation_type.as_str())
            .with_service(request.service.as_str())
            .with_retries(attempts.saturating_sub(1), max_attempts.saturating_sub(1))
            .with_metadata("request_id", request.request_id.as_str())
            .with_metadata("attempts", attempts);
        if let Some(agent) = request.agents.first() {
            context = context.with_agent(agent.as_str());
        }
        if let Some(id) = &checkpoint_id {
            context = context.with_checkpoint(id.as_str());
        }
        if request.rollback_required || (cancelled && checkpoint_id.is_some()) {
            context = context.require_rollback();
        }
        if request.privacy_sensitive {
            context = context.privacy_sensitive();
        }

        let response = self.coordinator.handle(&error, context);

        if !response.rolled_back {
            if let Some(id) = &checkpoint_id {
                self.checkpoints.release_checkpoint(id);
            }
        }

        if !cancelled || self.orchestrator.is_active(operation_id) {
            if let Err(e) = self.orchestrator.fail_operation(operation_id, error.to_string()) {
                tracing::debug!(operation_id = %operation_id, error = %e, "Operation already finished");
            }
        }

        OperationFailure {
            error,
            response: Some(response),
            progress: self.orchestrator.get_progress(operation_id),
        }
    }
}

impl Default for OperationSupervisor {
    fn default() -> Self {
        Self::standalone()
    }
}
