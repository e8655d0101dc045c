/// Error handlers and the structured response they produce
///
/// Handlers form a priority-ordered chain: the coordinator asks each one, in
/// ascending priority number, whether it can handle a record and uses the
/// first that says yes. [`DefaultHandler`] accepts everything.
use super::record::{ErrorCategory, ErrorContext, ErrorRecord, ErrorSeverity, RecoveryStrategy};
use crate::config::duration_format;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDirective {
    Retry,
    Rollback,
    Degrade,
    Escalate,
    Abort,
}

impl fmt::Display for RecoveryDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryDirective::Retry => "retry",
            RecoveryDirective::Rollback => "rollback",
            RecoveryDirective::Degrade => "degrade",
            RecoveryDirective::Escalate => "escalate",
            RecoveryDirective::Abort => "abort",
        };
        f.write_str(s)
    }
}

impl From<RecoveryStrategy> for RecoveryDirective {
    fn from(strategy: RecoveryStrategy) -> Self {
        match strategy {
            RecoveryStrategy::Retry | RecoveryStrategy::RetryWithBackoff => RecoveryDirective::Retry,
            RecoveryStrategy::Rollback => RecoveryDirective::Rollback,
            RecoveryStrategy::Fallback | RecoveryStrategy::SimplifyWorkflow => {
                RecoveryDirective::Degrade
            }
            RecoveryStrategy::Escalate => RecoveryDirective::Escalate,
            RecoveryStrategy::Abort => RecoveryDirective::Abort,
        }
    }
}

/// User-facing outcome of handling one error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Id of the underlying [`ErrorRecord`]
    pub error_id: String,

    pub category: ErrorCategory,
    pub severity: ErrorSeverity,

    /// Handler that produced the response
    pub handler: String,

    /// Message safe to show to an end user
    pub user_message: String,

    pub suggested_actions: Vec<String>,
    pub recovery_options: Vec<String>,

    pub retry_allowed: bool,
    pub fallback_available: bool,

    #[serde(with = "duration_format::option")]
    pub estimated_recovery_time: Option<Duration>,

    pub directive: RecoveryDirective,

    /// Set once the coordinator escalated the error
    pub escalated: bool,

    /// Reference users quote to support, present when escalated
    pub support_reference: Option<String>,

    /// Category breaker was open; no handler ran
    pub breaker_open: bool,

    pub recovery_attempted: bool,
    pub rolled_back: bool,
}

impl ErrorResponse {
    /// Baseline response for `record` produced by `handler`
    pub fn for_record(record: &ErrorRecord, handler: impl Into<String>) -> Self {
        Self {
            error_id: record.id.clone(),
            category: record.category,
            severity: record.severity,
            handler: handler.into(),
            user_message: "Something went wrong while processing your request.".to_string(),
            suggested_actions: Vec::new(),
            recovery_options: Vec::new(),
            retry_allowed: record.category.is_transient(),
            fallback_available: false,
            estimated_recovery_time: None,
            directive: record.recovery_strategy.into(),
            escalated: false,
            support_reference: None,
            breaker_open: false,
            recovery_attempted: false,
            rolled_back: false,
        }
    }

    /// Response used while the category breaker is open
    pub fn unavailable(record: &ErrorRecord, retry_after: Option<Duration>) -> Self {
        Self {
            user_message: format!(
                "{} operations are temporarily unavailable. Please try again shortly.",
                category_label(record.category)
            ),
            suggested_actions: vec!["Wait a moment before retrying".to_string()],
            retry_allowed: false,
            estimated_recovery_time: retry_after,
            directive: RecoveryDirective::Degrade,
            breaker_open: true,
            ..Self::for_record(record, "category_breaker")
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggested_actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_recovery_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recovery_options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_directive(mut self, directive: RecoveryDirective) -> Self {
        self.directive = directive;
        self
    }

    pub fn retryable(mut self, retry_allowed: bool) -> Self {
        self.retry_allowed = retry_allowed;
        self
    }

    pub fn with_fallback(mut self, fallback_available: bool) -> Self {
        self.fallback_available = fallback_available;
        self
    }

    pub fn with_estimated_recovery(mut self, estimate: Duration) -> Self {
        self.estimated_recovery_time = Some(estimate);
        self
    }
}

fn category_label(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::SystemFailure => "System",
        ErrorCategory::ResourceExhaustion => "Resource-intensive",
        ErrorCategory::Network => "Network",
        ErrorCategory::Timeout => "Long-running",
        ErrorCategory::Coordination => "Multi-agent",
        ErrorCategory::Validation => "Input",
        ErrorCategory::ExternalService => "External service",
        ErrorCategory::Security => "Secured",
        ErrorCategory::Unknown => "Some",
    }
}

/// One link of the handler chain
pub trait ErrorHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Lower numbers are consulted first
    fn priority(&self) -> u32;

    fn can_handle(&self, record: &ErrorRecord) -> bool;

    fn handle(&self, record: &ErrorRecord, context: &ErrorContext) -> ErrorResponse;
}

/// Handler built from a predicate and a closure
pub struct FnHandler<P, H> {
    name: String,
    priority: u32,
    predicate: P,
    handler: H,
}

impl<P, H> FnHandler<P, H>
where
    P: Fn(&ErrorRecord) -> bool + Send + Sync,
    H: Fn(&ErrorRecord, &ErrorContext) -> ErrorResponse + Send + Sync,
{
    pub fn new(name: impl Into<String>, priority: u32, predicate: P, handler: H) -> Self {
        Self {
            name: name.into(),
            priority,
            predicate,
            handler,
        }
    }
}

impl<P, H> ErrorHandler for FnHandler<P, H>
where
    P: Fn(&ErrorRecord) -> bool + Send + Sync,
    H: Fn(&ErrorRecord, &ErrorContext) -> ErrorResponse + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        (self.predicate)(record)
    }

    fn handle(&self, record: &ErrorRecord, context: &ErrorContext) -> ErrorResponse {
        (self.handler)(record, context)
    }
}

/// System failures: never retried locally, always escalated
pub struct SystemFailureHandler;

impl ErrorHandler for SystemFailureHandler {
    fn name(&self) -> &str {
        "system_failure"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        record.category == ErrorCategory::SystemFailure
    }

    fn handle(&self, record: &ErrorRecord, _context: &ErrorContext) -> ErrorResponse {
        ErrorResponse::for_record(record, self.name())
            .with_message(
                "A system error interrupted this operation. Our team has been notified.",
            )
            .with_actions(["Contact support with the reference below"])
            .with_recovery_options(["restore_last_checkpoint"])
            .retryable(false)
            .with_directive(RecoveryDirective::Escalate)
    }
}

/// Security and compliance failures abort the operation
pub struct SecurityHandler;

impl ErrorHandler for SecurityHandler {
    fn name(&self) -> &str {
        "security"
    }

    fn priority(&self) -> u32 {
        3
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        record.category == ErrorCategory::Security
    }

    fn handle(&self, record: &ErrorRecord, _context: &ErrorContext) -> ErrorResponse {
        ErrorResponse::for_record(record, self.name())
            .with_message("This action is not permitted with the current access rights.")
            .with_actions([
                "Check that you have access to the requested resource",
                "Sign in again if your session expired",
            ])
            .retryable(false)
            .with_directive(RecoveryDirective::Abort)
    }
}

/// Input problems: the user can fix and resubmit
pub struct ValidationHandler;

impl ErrorHandler for ValidationHandler {
    fn name(&self) -> &str {
        "validation"
    }

    fn priority(&self) -> u32 {
        5
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        record.category == ErrorCategory::Validation
    }

    fn handle(&self, record: &ErrorRecord, _context: &ErrorContext) -> ErrorResponse {
        ErrorResponse::for_record(record, self.name())
            .with_message(format!(
                "Some of the provided information is not valid: {}",
                record.message
            ))
            .with_actions(["Correct the highlighted input and try again"])
            .with_recovery_options(["resubmit"])
            .retryable(true)
            .with_directive(RecoveryDirective::Retry)
    }
}

/// Network, timeout and external-service failures
pub struct NetworkHandler {
    base_delay: Duration,
    max_delay: Duration,
}

impl NetworkHandler {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Exponential guidance from the retry count so far
    fn estimate(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for NetworkHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl ErrorHandler for NetworkHandler {
    fn name(&self) -> &str {
        "network"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        matches!(
            record.category,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::ExternalService
        )
    }

    fn handle(&self, record: &ErrorRecord, context: &ErrorContext) -> ErrorResponse {
        let external = record.category == ErrorCategory::ExternalService;
        let message = match (&context.service, external) {
            (Some(service), true) => format!("The {} service is not responding right now.", service),
            (None, true) => "An external data provider is not responding right now.".to_string(),
            _ => "We could not reach a required service. Retrying should help.".to_string(),
        };

        let mut options = vec!["retry_with_backoff"];
        if external {
            options.push("use_cached_data");
        }

        ErrorResponse::for_record(record, self.name())
            .with_message(message)
            .with_actions([
                "Wait a moment and retry",
                "Check your network connection if the problem persists",
            ])
            .with_recovery_options(options)
            .retryable(true)
            .with_fallback(external)
            .with_estimated_recovery(self.estimate(context.retry_count))
            .with_directive(if external && context.retries_exhausted() {
                RecoveryDirective::Degrade
            } else {
                RecoveryDirective::Retry
            })
    }
}

/// Agent coordination and workflow failures
pub struct CoordinationHandler;

impl ErrorHandler for CoordinationHandler {
    fn name(&self) -> &str {
        "coordination"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        record.category == ErrorCategory::Coordination
    }

    fn handle(&self, record: &ErrorRecord, context: &ErrorContext) -> ErrorResponse {
        let rollback = context.rollback_required || record.severity.warrants_rollback();
        let response = ErrorResponse::for_record(record, self.name()).retryable(true);

        if rollback {
            response
                .with_message("The agents lost track of this task. Changes were undone so you can retry safely.")
                .with_actions(["Retry the request"])
                .with_recovery_options(["rollback", "retry"])
                .with_directive(RecoveryDirective::Rollback)
        } else {
            response
                .with_message("The task was too complex to coordinate. Trying a simpler workflow.")
                .with_actions(["Retry with a narrower request"])
                .with_recovery_options(["simplified_workflow", "single_agent"])
                .with_fallback(true)
                .with_directive(RecoveryDirective::Degrade)
        }
    }
}

/// Catch-all
pub struct DefaultHandler;

impl ErrorHandler for DefaultHandler {
    fn name(&self) -> &str {
        "default"
    }

    fn priority(&self) -> u32 {
        1000
    }

    fn can_handle(&self, _record: &ErrorRecord) -> bool {
        true
    }

    fn handle(&self, record: &ErrorRecord, _context: &ErrorContext) -> ErrorResponse {
        ErrorResponse::for_record(record, self.name())
            .with_actions(["Try again", "Contact support if the problem continues"])
            .with_recovery_options(["retry"])
            .retryable(record.severity < ErrorSeverity::Critical)
    }
}

/// Built-in handler chain
pub fn builtin_handlers() -> Vec<Arc<dyn ErrorHandler>> {
    vec![
        Arc::new(SystemFailureHandler),
        Arc::new(SecurityHandler),
        Arc::new(ValidationHandler),
        Arc::new(NetworkHandler::default()),
        Arc::new(CoordinationHandler),
        Arc::new(DefaultHandler),
    ]
}
