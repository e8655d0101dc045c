/// Unified error coordinator
///
/// Single entry point for terminal failures. Each error is classified into an
/// [`ErrorRecord`], stored in a bounded history, routed through the handler
/// chain and turned into an [`ErrorResponse`]. The coordinator then applies
/// escalation and, when warranted, rolls the operation back through the
/// checkpoint manager.
///
/// Every category has its own circuit breaker, separate from the per-service
/// breakers of the retry engine. Each handled error counts as a failure of its
/// category and a successful recovery reported through
/// [`UnifiedErrorCoordinator::mark_recovery_outcome`] counts as a success.
/// While a category breaker is open, handlers are skipped and a "temporarily
/// unavailable" response is returned; escalation and rollback still apply.
///
/// With an orchestrator attached, a record only links to operations the
/// orchestrator knows (active or in its history). Other ids are moved into the
/// record context as `unknown_operation_id`.
use super::audit::AuditLog;
use super::classification::ErrorClassifier;
use super::handlers::{builtin_handlers, DefaultHandler, ErrorHandler, ErrorResponse, RecoveryDirective};
use super::record::{ErrorCategory, ErrorContext, ErrorRecord, ErrorSeverity};
use crate::cancellation::OperationOrchestrator;
use crate::checkpoint::{CheckpointManager, RollbackKind};
use crate::config::duration_format;
use crate::notification::NotificationHub;
use crate::retry::{CircuitBreakerRegistry, CircuitBreakerSettings, CircuitBreakerSnapshot};
use crate::OpguardError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Coordinator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Records kept in the bounded history
    pub history_limit: usize,

    /// Window for escalation counts and related-error correlation
    #[serde(with = "duration_format")]
    pub escalation_window: Duration,

    /// Escalate once this many errors of a category fall within the window
    pub category_thresholds: HashMap<ErrorCategory, u32>,

    /// Escalate once this many errors of a severity fall within the window
    pub severity_thresholds: HashMap<ErrorSeverity, u32>,

    /// Per-category circuit breaker
    pub category_breaker: CircuitBreakerSettings,

    /// Prefix of generated support references
    pub support_reference_prefix: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        let category_thresholds = HashMap::from([
            (ErrorCategory::SystemFailure, 3),
            (ErrorCategory::ResourceExhaustion, 5),
            (ErrorCategory::Network, 10),
            (ErrorCategory::Timeout, 10),
            (ErrorCategory::ExternalService, 10),
            (ErrorCategory::Coordination, 5),
            (ErrorCategory::Security, 1),
        ]);
        let severity_thresholds = HashMap::from([
            (ErrorSeverity::Critical, 1),
            (ErrorSeverity::High, 5),
            (ErrorSeverity::Medium, 20),
            (ErrorSeverity::Low, 50),
        ]);

        Self {
            history_limit: 1000,
            escalation_window: Duration::from_secs(300),
            category_thresholds,
            severity_thresholds,
            category_breaker: CircuitBreakerSettings {
                enabled: true,
                failure_threshold: 10,
                success_threshold: 1,
                cooldown: Duration::from_secs(30),
            },
            support_reference_prefix: "OPG".to_string(),
        }
    }
}

/// Counters exposed by [`UnifiedErrorCoordinator::stats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub total_errors: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub by_severity: HashMap<ErrorSeverity, u64>,
    pub by_agent: HashMap<String, u64>,
    pub handler_hits: HashMap<String, u64>,
    pub escalations: u64,
    pub breaker_rejections: u64,
    pub rollbacks_attempted: u64,
    pub rollbacks_succeeded: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_failed: u64,
    pub active_errors: usize,
}

#[derive(Default)]
struct ErrorHistory {
    records: VecDeque<ErrorRecord>,
    active: HashMap<String, ErrorRecord>,
}

impl ErrorHistory {
    fn update<F>(&mut self, error_id: &str, f: F) -> bool
    where
        F: Fn(&mut ErrorRecord),
    {
        let mut found = false;
        if let Some(record) = self.active.get_mut(error_id) {
            f(record);
            found = true;
        }
        if let Some(record) = self.records.iter_mut().rev().find(|r| r.id == error_id) {
            f(record);
            found = true;
        }
        found
    }
}

/// Classifies, dispatches and escalates terminal failures
pub struct UnifiedErrorCoordinator {
    settings: CoordinatorSettings,
    classifier: ErrorClassifier,

    /// Sorted by ascending priority; equal priorities keep registration order
    handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,

    history: Mutex<ErrorHistory>,
    stats: Mutex<CoordinatorStats>,
    category_breakers: CircuitBreakerRegistry,

    checkpoints: Option<Arc<CheckpointManager>>,
    orchestrator: Option<Arc<OperationOrchestrator>>,
    audit: Option<Arc<dyn AuditLog>>,
    notifications: Arc<NotificationHub>,
}

impl UnifiedErrorCoordinator {
    /// Coordinator with the built-in handler chain
    pub fn new(settings: CoordinatorSettings) -> Self {
        let category_breakers = CircuitBreakerRegistry::new(settings.category_breaker.clone());
        Self {
            settings,
            classifier: ErrorClassifier::new(),
            handlers: RwLock::new(builtin_handlers()),
            history: Mutex::new(ErrorHistory::default()),
            stats: Mutex::new(CoordinatorStats::default()),
            category_breakers,
            checkpoints: None,
            orchestrator: None,
            audit: None,
            notifications: Arc::new(NotificationHub::default()),
        }
    }

    /// Roll back through `checkpoints` when an error warrants it
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Check operation ids against `orchestrator`
    pub fn with_orchestrator(mut self, orchestrator: Arc<OperationOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<NotificationHub>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Add a handler to the chain
    pub fn register_handler(&self, handler: Arc<dyn ErrorHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let at = handlers
            .iter()
            .position(|h| h.priority() > handler.priority())
            .unwrap_or(handlers.len());
        tracing::debug!(
            handler = handler.name(),
            priority = handler.priority(),
            "Error handler registered"
        );
        handlers.insert(at, handler);
    }

    /// Names of the registered handlers in dispatch order
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Handle an action failure
    pub fn handle_error(&self, error: anyhow::Error, context: ErrorContext) -> ErrorResponse {
        self.handle(&OpguardError::from(error), context)
    }

    /// Classify, dispatch and escalate one failure
    pub fn handle(&self, error: &OpguardError, context: ErrorContext) -> ErrorResponse {
        let mut record = self.classifier.classify(error, &context);
        self.verify_operation(&mut record);

        let (category_count, severity_count) = {
            let history = self.lock_history();
            let window_start = self.window_start();
            let mut category_count = 1u32;
            let mut severity_count = 1u32;
            for earlier in history.records.iter().filter(|r| r.created_at >= window_start) {
                if earlier.category == record.category {
                    category_count += 1;
                }
                if earlier.severity == record.severity {
                    severity_count += 1;
                }
                if record.operation_id.is_some() && earlier.operation_id == record.operation_id {
                    record.related_errors.push(earlier.id.clone());
                }
            }
            (category_count, severity_count)
        };

        let breaker = self
            .category_breakers
            .get_or_create(record.category.as_str(), &self.settings.category_breaker);
        let breaker_open =
            self.settings.category_breaker.enabled && record.severity > ErrorSeverity::Info && !breaker.can_proceed();

        let mut response = if breaker_open {
            ErrorResponse::unavailable(&record, breaker.snapshot().cooldown_remaining)
        } else {
            self.dispatch(&record, &context)
        };

        if self.settings.category_breaker.enabled && !breaker_open && record.severity > ErrorSeverity::Info {
            breaker.record_failure();
        }

        let escalate = record.severity == ErrorSeverity::Critical
            || record.privacy_sensitive
            || response.directive == RecoveryDirective::Escalate
            || self.reaches(self.settings.category_thresholds.get(&record.category), category_count)
            || self.reaches(self.settings.severity_thresholds.get(&record.severity), severity_count);
        if escalate {
            response.escalated = true;
            response.retry_allowed = false;
            response.support_reference = Some(self.support_reference(&record));
        }

        if context.rollback_required || record.severity.warrants_rollback() {
            if let Some(rolled_back) = self.try_rollback(&record, &context) {
                response.recovery_attempted = true;
                response.rolled_back = rolled_back;
                record.mark_recovery(rolled_back);
            }
        }

        self.store(&record, &response, breaker_open);

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record(&record, &response) {
                tracing::warn!(error_id = %record.id, error = %e, "Failed to write error audit entry");
            }
        }

        self.log(&record, &response);
        self.notifications.error(&response);
        response
    }

    /// Report whether recovery for `error_id` eventually worked
    ///
    /// Feeds the category breaker. Returns false for unknown ids.
    pub fn mark_recovery_outcome(&self, error_id: &str, successful: bool) -> bool {
        let category = {
            let mut history = self.lock_history();
            if !history.update(error_id, |r| r.mark_recovery(successful)) {
                return false;
            }
            history
                .active
                .get(error_id)
                .or_else(|| history.records.iter().find(|r| r.id == error_id))
                .map(|r| r.category)
        };

        if successful {
            if let Some(category) = category {
                if let Some(breaker) = self.category_breakers.get(category.as_str()) {
                    breaker.record_success();
                }
            }
        }

        {
            let mut stats = self.lock_stats();
            if successful {
                stats.recoveries_succeeded += 1;
            } else {
                stats.recoveries_failed += 1;
            }
        }

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.update_outcome(error_id, successful) {
                tracing::warn!(error_id = error_id, error = %e, "Failed to update error audit entry");
            }
        }
        true
    }

    /// Remove `error_id` from the active set
    pub fn resolve(&self, error_id: &str) -> Option<ErrorRecord> {
        let resolved = self.lock_history().active.remove(error_id);
        if resolved.is_some() {
            tracing::debug!(error_id = error_id, "Error resolved");
        }
        resolved
    }

    /// Errors not yet resolved
    pub fn active_errors(&self) -> Vec<ErrorRecord> {
        let mut active: Vec<ErrorRecord> = self.lock_history().active.values().cloned().collect();
        active.sort_by_key(|r| r.created_at);
        active
    }

    /// Most recent records, newest first
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.lock_history()
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn errors_for_operation(&self, operation_id: &str) -> Vec<ErrorRecord> {
        self.lock_history()
            .records
            .iter()
            .filter(|r| r.operation_id.as_deref() == Some(operation_id))
            .cloned()
            .collect()
    }

    pub fn get(&self, error_id: &str) -> Option<ErrorRecord> {
        let history = self.lock_history();
        history
            .active
            .get(error_id)
            .or_else(|| history.records.iter().find(|r| r.id == error_id))
            .cloned()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = self.lock_stats().clone();
        stats.active_errors = self.lock_history().active.len();
        stats
    }

    pub fn category_breakers(&self) -> Vec<CircuitBreakerSnapshot> {
        self.category_breakers.snapshots()
    }

    /// Close every category breaker
    pub fn reset_category_breakers(&self) {
        self.category_breakers.reset_all();
    }

    fn dispatch(&self, record: &ErrorRecord, context: &ErrorContext) -> ErrorResponse {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.iter().find(|h| h.can_handle(record)).cloned()
        };

        let Some(handler) = handler else {
            return DefaultHandler.handle(record, context);
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(record, context))) {
            Ok(response) => response,
            Err(_) => {
                tracing::error!(
                    handler = handler.name(),
                    error_id = %record.id,
                    "Error handler panicked, using default handler"
                );
                DefaultHandler.handle(record, context)
            }
        }
    }

    fn reaches(&self, threshold: Option<&u32>, count: u32) -> bool {
        matches!(threshold, Some(&t) if t > 0 && count >= t)
    }

    fn support_reference(&self, record: &ErrorRecord) -> String {
        format!(
            "{}-{}-{}",
            self.settings.support_reference_prefix,
            record.created_at.format("%Y%m%d"),
            record.short_id().to_uppercase()
        )
    }

    fn verify_operation(&self, record: &mut ErrorRecord) {
        let Some(orchestrator) = &self.orchestrator else {
            return;
        };
        let Some(operation_id) = record.operation_id.take() else {
            return;
        };
        if orchestrator.get_progress(&operation_id).is_some() {
            record.operation_id = Some(operation_id);
            return;
        }

        tracing::warn!(
            error_id = %record.id,
            operation_id = %operation_id,
            "Error refers to an unknown operation, link dropped"
        );
        if let serde_json::Value::Object(map) = &mut record.context {
            map.insert(
                "unknown_operation_id".to_string(),
                serde_json::Value::String(operation_id),
            );
        }
    }

    /// Roll back the checkpoint named by the context, or the latest of the
    /// operation. None when there is nothing to roll back.
    fn try_rollback(&self, record: &ErrorRecord, context: &ErrorContext) -> Option<bool> {
        let checkpoints = self.checkpoints.as_ref()?;
        let checkpoint_id = context.checkpoint_id.clone().or_else(|| {
            record
                .operation_id
                .as_deref()
                .and_then(|op| checkpoints.latest_for_operation(op))
        })?;

        let reason = format!("{} error: {}", record.category, record.message);
        match checkpoints.rollback(&checkpoint_id, &reason, RollbackKind::Automatic) {
            Ok(()) => {
                tracing::info!(
                    error_id = %record.id,
                    checkpoint_id = %checkpoint_id,
                    "Rolled back after error"
                );
                Some(true)
            }
            Err(e) => {
                tracing::error!(
                    error_id = %record.id,
                    checkpoint_id = %checkpoint_id,
                    error = %e,
                    "Automatic rollback failed"
                );
                Some(false)
            }
        }
    }

    fn store(&self, record: &ErrorRecord, response: &ErrorResponse, breaker_open: bool) {
        {
            let mut history = self.lock_history();
            history.records.push_back(record.clone());
            history.active.insert(record.id.clone(), record.clone());
            while history.records.len() > self.settings.history_limit.max(1) {
                if let Some(evicted) = history.records.pop_front() {
                    history.active.remove(&evicted.id);
                }
            }
        }

        let mut stats = self.lock_stats();
        stats.total_errors += 1;
        *stats.by_category.entry(record.category).or_default() += 1;
        *stats.by_severity.entry(record.severity).or_default() += 1;
        if let Some(agent) = &record.agent_id {
            *stats.by_agent.entry(agent.clone()).or_default() += 1;
        }
        *stats.handler_hits.entry(response.handler.clone()).or_default() += 1;
        if response.escalated {
            stats.escalations += 1;
        }
        if breaker_open {
            stats.breaker_rejections += 1;
        }
        if response.recovery_attempted {
            stats.rollbacks_attempted += 1;
            if response.rolled_back {
                stats.rollbacks_succeeded += 1;
            }
        }
    }

    fn log(&self, record: &ErrorRecord, response: &ErrorResponse) {
        let operation_id = record.operation_id.as_deref().unwrap_or("-");
        if response.escalated {
            tracing::error!(
                error_id = %record.id,
                operation_id = operation_id,
                category = %record.category,
                severity = %record.severity,
                handler = %response.handler,
                support_reference = response.support_reference.as_deref().unwrap_or("-"),
                message = %record.message,
                "Error escalated"
            );
        } else {
            tracing::warn!(
                error_id = %record.id,
                operation_id = operation_id,
                category = %record.category,
                severity = %record.severity,
                handler = %response.handler,
                directive = %response.directive,
                retry_allowed = response.retry_allowed,
                message = %record.message,
                "Error handled"
            );
        }
    }

    fn window_start(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.settings.escalation_window)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        Utc::now() - window
    }

    fn lock_history(&self) -> MutexGuard<'_, ErrorHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, CoordinatorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for UnifiedErrorCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{RollbackScope, SharedState, StateAccessor};
    use crate::error::audit::SqliteAuditLog;
    use crate::error::handlers::FnHandler;
    use crate::notification::{ChannelSink, Notification};
    use anyhow::anyhow;
    use serde_json::json;

    fn network_error() -> OpguardError {
        OpguardError::Action(anyhow!("connection reset by peer"))
    }

    #[test]
    fn test_network_error_is_retryable() {
        let coordinator = UnifiedErrorCoordinator::default();
        let response = coordinator.handle(
            &network_error(),
            ErrorContext::for_operation("op-1").with_service("quotes"),
        );

        assert_eq!(response.category, ErrorCategory::Network);
        assert_eq!(response.handler, "network");
        assert!(response.retry_allowed);
        assert!(!response.escalated);
        assert!(response.support_reference.is_none());
        assert_eq!(coordinator.active_errors().len(), 1);
    }

    #[test]
    fn test_critical_severity_always_escalates() {
        let coordinator = UnifiedErrorCoordinator::default();
        // A permissive handler in front of everything must not win
        coordinator.register_handler(Arc::new(FnHandler::new(
            "permissive",
            0,
            |_: &ErrorRecord| true,
            |r: &ErrorRecord, _: &ErrorContext| {
                ErrorResponse::for_record(r, "permissive").retryable(true)
            },
        )));

        let response = coordinator.handle(
            &network_error(),
            ErrorContext::new().with_severity(ErrorSeverity::Critical),
        );
        assert_eq!(response.handler, "permissive");
        assert!(!response.retry_allowed);
        assert!(response.escalated);
        let reference = response.support_reference.unwrap();
        assert!(reference.starts_with("OPG-"));
        assert_eq!(coordinator.stats().escalations, 1);
    }

    #[test]
    fn test_privacy_sensitive_escalates() {
        let coordinator = UnifiedErrorCoordinator::default();
        let response = coordinator.handle(
            &OpguardError::Action(anyhow!("invalid date in filing")),
            ErrorContext::new().privacy_sensitive(),
        );
        assert!(response.escalated);
        assert!(!response.retry_allowed);
    }

    #[test]
    fn test_category_threshold_escalates() {
        let mut settings = CoordinatorSettings::default();
        settings.category_thresholds.insert(ErrorCategory::Network, 3);
        let coordinator = UnifiedErrorCoordinator::new(settings);

        let first = coordinator.handle(&network_error(), ErrorContext::new());
        let second = coordinator.handle(&network_error(), ErrorContext::new());
        let third = coordinator.handle(&network_error(), ErrorContext::new());
        assert!(!first.escalated);
        assert!(!second.escalated);
        assert!(third.escalated);
    }

    #[test]
    fn test_handler_priority_order() {
        let coordinator = UnifiedErrorCoordinator::default();
        coordinator.register_handler(Arc::new(FnHandler::new(
            "late_network",
            50,
            |r: &ErrorRecord| r.category == ErrorCategory::Network,
            |r: &ErrorRecord, _: &ErrorContext| ErrorResponse::for_record(r, "late_network"),
        )));
        coordinator.register_handler(Arc::new(FnHandler::new(
            "early_network",
            7,
            |r: &ErrorRecord| r.category == ErrorCategory::Network,
            |r: &ErrorRecord, _: &ErrorContext| ErrorResponse::for_record(r, "early_network"),
        )));

        let names = coordinator.handler_names();
        assert_eq!(names.first().map(String::as_str), Some("system_failure"));
        assert_eq!(names.last().map(String::as_str), Some("default"));

        let response = coordinator.handle(&network_error(), ErrorContext::new());
        assert_eq!(response.handler, "early_network");
    }

    #[test]
    fn test_panicking_handler_falls_back_to_default() {
        let coordinator = UnifiedErrorCoordinator::default();
        coordinator.register_handler(Arc::new(FnHandler::new(
            "buggy",
            0,
            |_: &ErrorRecord| true,
            |_: &ErrorRecord, _: &ErrorContext| -> ErrorResponse { panic!("handler bug") },
        )));
        let response = coordinator.handle(&network_error(), ErrorContext::new());
        assert_eq!(response.handler, "default");
    }

    #[test]
    fn test_open_category_breaker_skips_handlers() {
        let mut settings = CoordinatorSettings::default();
        settings.category_breaker.failure_threshold = 2;
        settings.category_breaker.cooldown = Duration::from_secs(600);
        let coordinator = UnifiedErrorCoordinator::new(settings);

        coordinator.handle(&network_error(), ErrorContext::new());
        coordinator.handle(&network_error(), ErrorContext::new());
        let rejected = coordinator.handle(&network_error(), ErrorContext::new());

        assert!(rejected.breaker_open);
        assert_eq!(rejected.handler, "category_breaker");
        assert!(!rejected.retry_allowed);
        assert!(rejected.estimated_recovery_time.is_some());
        assert_eq!(coordinator.stats().breaker_rejections, 1);

        // other categories are unaffected
        let validation = coordinator.handle(
            &OpguardError::Action(anyhow!("invalid ticker symbol")),
            ErrorContext::new(),
        );
        assert!(!validation.breaker_open);
        assert_eq!(validation.handler, "validation");
    }

    #[test]
    fn test_recovery_outcome_is_recorded() {
        let mut settings = CoordinatorSettings::default();
        settings.category_breaker.failure_threshold = 1;
        settings.category_breaker.cooldown = Duration::ZERO;
        let coordinator = UnifiedErrorCoordinator::new(settings);

        let first = coordinator.handle(&network_error(), ErrorContext::new());
        // cooldown zero: next error is admitted as a half-open trial and reopens
        let second = coordinator.handle(&network_error(), ErrorContext::new());
        assert!(!second.breaker_open);

        assert!(coordinator.mark_recovery_outcome(&first.error_id, true));
        assert!(!coordinator.mark_recovery_outcome("unknown", true));
        let record = coordinator.get(&first.error_id).unwrap();
        assert_eq!(record.recovery_successful, Some(true));
        assert_eq!(coordinator.stats().recoveries_succeeded, 1);
    }

    #[test]
    fn test_related_errors_share_operation() {
        let coordinator = UnifiedErrorCoordinator::default();
        let a = coordinator.handle(&network_error(), ErrorContext::for_operation("op-1"));
        coordinator.handle(&network_error(), ErrorContext::for_operation("op-2"));
        let c = coordinator.handle(&network_error(), ErrorContext::for_operation("op-1"));

        let record = coordinator.get(&c.error_id).unwrap();
        assert_eq!(record.related_errors, vec![a.error_id]);
        assert_eq!(coordinator.errors_for_operation("op-1").len(), 2);
    }

    #[test]
    fn test_high_severity_rolls_back() {
        let state = Arc::new(SharedState::new(json!({"title": "draft"})));
        let checkpoints = Arc::new(CheckpointManager::default());
        checkpoints
            .register_accessor(RollbackScope::DocumentState, state.clone())
            .unwrap();
        checkpoints
            .create_checkpoint("op-1", RollbackScope::DocumentState, "before edit")
            .unwrap();
        state.write(json!({"title": "half written"})).unwrap();

        let coordinator = UnifiedErrorCoordinator::default().with_checkpoints(checkpoints.clone());
        let response = coordinator.handle(
            &OpguardError::Action(anyhow!("agent coordination deadlock")),
            ErrorContext::for_operation("op-1").with_severity(ErrorSeverity::High),
        );

        assert!(response.recovery_attempted);
        assert!(response.rolled_back);
        assert_eq!(state.get(), json!({"title": "draft"}));
        assert!(checkpoints.is_empty());
        assert_eq!(checkpoints.stats().automatic_rollbacks, 1);
    }

    #[test]
    fn test_medium_severity_does_not_roll_back() {
        let state = Arc::new(SharedState::new(json!(1)));
        let checkpoints = Arc::new(CheckpointManager::default());
        checkpoints
            .register_accessor(RollbackScope::AgentState, state.clone())
            .unwrap();
        checkpoints
            .create_checkpoint("op-1", RollbackScope::AgentState, "start")
            .unwrap();
        state.write(json!(2)).unwrap();

        let coordinator = UnifiedErrorCoordinator::default().with_checkpoints(checkpoints.clone());
        let response = coordinator.handle(&network_error(), ErrorContext::for_operation("op-1"));
        assert!(!response.recovery_attempted);
        assert_eq!(state.get(), json!(2));

        let response = coordinator.handle(
            &network_error(),
            ErrorContext::for_operation("op-1").require_rollback(),
        );
        assert!(response.rolled_back);
        assert_eq!(state.get(), json!(1));
    }

    #[test]
    fn test_resolve_and_history_bound() {
        let settings = CoordinatorSettings {
            history_limit: 3,
            ..CoordinatorSettings::default()
        };
        let coordinator = UnifiedErrorCoordinator::new(settings);
        let ids: Vec<String> = (0..5)
            .map(|_| coordinator.handle(&network_error(), ErrorContext::new()).error_id)
            .collect();

        assert_eq!(coordinator.recent_errors(10).len(), 3);
        assert_eq!(coordinator.recent_errors(1)[0].id, ids[4]);
        // evicted records leave the active set too
        assert!(coordinator.resolve(&ids[0]).is_none());
        assert!(coordinator.resolve(&ids[4]).is_some());
        assert!(coordinator.resolve(&ids[4]).is_none());
        assert_eq!(coordinator.stats().active_errors, 2);
    }

    #[test]
    fn test_operation_link_requires_known_operation() {
        let orchestrator = OperationOrchestrator::standalone();
        orchestrator.start_operation("op-live", "req", None).unwrap();
        orchestrator.start_operation("op-done", "req", None).unwrap();
        orchestrator.complete_operation("op-done").unwrap();
        let coordinator = UnifiedErrorCoordinator::default().with_orchestrator(orchestrator);

        for known in ["op-live", "op-done"] {
            let response = coordinator.handle(&network_error(), ErrorContext::for_operation(known));
            let record = coordinator.get(&response.error_id).unwrap();
            assert_eq!(record.operation_id.as_deref(), Some(known));
        }

        let response = coordinator.handle(&network_error(), ErrorContext::for_operation("op-ghost"));
        let record = coordinator.get(&response.error_id).unwrap();
        assert_eq!(record.operation_id, None);
        assert_eq!(record.context["unknown_operation_id"], "op-ghost");
    }

    #[test]
    fn test_audit_and_notifications() {
        let audit = Arc::new(SqliteAuditLog::in_memory().unwrap());
        let hub = Arc::new(NotificationHub::default());
        let (sink, mut rx) = ChannelSink::new(8);
        hub.register(Arc::new(sink));

        let coordinator = UnifiedErrorCoordinator::default()
            .with_audit_log(audit.clone())
            .with_notifications(hub);
        let response = coordinator.handle(&network_error(), ErrorContext::for_operation("op-1"));

        let stored = audit.get(&response.error_id).unwrap().unwrap();
        assert_eq!(stored.response, response);
        match rx.try_recv().unwrap() {
            Notification::Error(notified) => assert_eq!(notified.error_id, response.error_id),
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[test]
    fn test_stats_counters() {
        let coordinator = UnifiedErrorCoordinator::default();
        coordinator.handle(&network_error(), ErrorContext::new().with_agent("fetcher"));
        coordinator.handle(
            &OpguardError::Action(anyhow!("invalid field")),
            ErrorContext::new().with_agent("fetcher"),
        );

        let stats = coordinator.stats();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.by_agent.get("fetcher"), Some(&2));
        assert_eq!(stats.by_category.get(&ErrorCategory::Validation), Some(&1));
        assert_eq!(stats.handler_hits.get("network"), Some(&1));
    }
}
