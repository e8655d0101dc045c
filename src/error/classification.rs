/// Error classification
///
/// Turns a raw failure plus caller context into an [`ErrorRecord`]. Typed
/// errors anywhere in the cause chain decide the category first; otherwise a
/// prioritized set of message patterns is consulted, falling back to
/// `Unknown`. Severity derives from the category and is adjusted by context.
use super::record::{ErrorCategory, ErrorContext, ErrorRecord, ErrorSeverity, RecoveryStrategy};
use crate::cancellation::CancelReason;
use crate::OpguardError;
use regex::RegexSet;
use std::io::ErrorKind;

/// Message heuristics, highest priority first
const CATEGORY_PATTERNS: [(ErrorCategory, &str); 8] = [
    (
        ErrorCategory::Security,
        r"(?i)(unauthori[sz]ed|forbidden|permission denied|access denied|authentication|credential|privacy|compliance|gdpr|\bpii\b|\b40[13]\b)",
    ),
    (
        ErrorCategory::ResourceExhaustion,
        r"(?i)(out of memory|\boom\b|disk full|no space left|quota|resource exhausted|too many open files|rate limit|\b429\b)",
    ),
    (
        ErrorCategory::Timeout,
        r"(?i)(timed out|timeout|deadline (has )?(elapsed|exceeded))",
    ),
    (
        ErrorCategory::Network,
        r"(?i)(network|connection (refused|reset|closed|aborted)|could not connect|dns|socket|unreachable|broken pipe)",
    ),
    (
        ErrorCategory::Validation,
        r"(?i)(invalid|validation|malformed|missing (field|parameter)|required field|failed to parse|schema|bad request|\b400\b)",
    ),
    (
        ErrorCategory::ExternalService,
        r"(?i)(external service|upstream|third[- ]party|\bapi\b|service unavailable|bad gateway|\b50[234]\b)",
    ),
    (
        ErrorCategory::Coordination,
        r"(?i)(agent|coordination|workflow|deadlock|conflict|hand-?off|orchestrat)",
    ),
    (
        ErrorCategory::SystemFailure,
        r"(?i)(panic|internal error|system failure|fatal|corrupt|database)",
    ),
];

/// Classifier shared by the coordinator
pub struct ErrorClassifier {
    patterns: RegexSet,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        let patterns = RegexSet::new(CATEGORY_PATTERNS.iter().map(|(_, p)| *p)).unwrap_or_else(
            |e| {
                tracing::error!(error = %e, "Error classification patterns failed to compile");
                RegexSet::empty()
            },
        );
        Self { patterns }
    }

    /// Build the immutable record for `error` under `context`
    pub fn classify(&self, error: &OpguardError, context: &ErrorContext) -> ErrorRecord {
        let category = context
            .category
            .unwrap_or_else(|| self.categorize(error));
        let severity = self.severity_for(error, category, context);

        let mut record = ErrorRecord::new(category, severity, error.to_string(), context);
        record.causes = cause_chain(error);
        record.recovery_strategy = strategy_for(category, context);
        record
    }

    /// Category of `error`, typed information first
    pub fn categorize(&self, error: &OpguardError) -> ErrorCategory {
        if let Some(category) = typed_category(error) {
            return category;
        }

        if let OpguardError::Action(inner) = error {
            for cause in inner.chain() {
                if let Some(category) = cause
                    .downcast_ref::<OpguardError>()
                    .and_then(typed_category)
                {
                    return category;
                }
                if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                    if let Some(category) = io_category(io.kind()) {
                        return category;
                    }
                }
                if cause.is::<tokio::time::error::Elapsed>() {
                    return ErrorCategory::Timeout;
                }
                if cause.is::<serde_json::Error>() {
                    return ErrorCategory::Validation;
                }
            }
        }

        self.categorize_message(&cause_chain(error).join(": "))
    }

    /// Category from message text alone
    pub fn categorize_message(&self, message: &str) -> ErrorCategory {
        self.patterns
            .matches(message)
            .iter()
            .next()
            .map(|idx| CATEGORY_PATTERNS[idx].0)
            .unwrap_or(ErrorCategory::Unknown)
    }

    fn severity_for(
        &self,
        error: &OpguardError,
        category: ErrorCategory,
        context: &ErrorContext,
    ) -> ErrorSeverity {
        if let Some(severity) = context.severity {
            return severity;
        }
        if error.is_cancelled() {
            return ErrorSeverity::Info;
        }

        let mut severity = base_severity(category);
        if context.retries_exhausted() && category.is_transient() {
            severity = severity.raised();
        }
        if context.privacy_sensitive {
            severity = severity.max(ErrorSeverity::High);
        }
        severity
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Default severity per category
pub fn base_severity(category: ErrorCategory) -> ErrorSeverity {
    match category {
        ErrorCategory::SystemFailure => ErrorSeverity::Critical,
        ErrorCategory::Security | ErrorCategory::ResourceExhaustion => ErrorSeverity::High,
        ErrorCategory::Network
        | ErrorCategory::Timeout
        | ErrorCategory::ExternalService
        | ErrorCategory::Coordination
        | ErrorCategory::Unknown => ErrorSeverity::Medium,
        ErrorCategory::Validation => ErrorSeverity::Low,
    }
}

fn strategy_for(category: ErrorCategory, context: &ErrorContext) -> RecoveryStrategy {
    match category {
        ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::ResourceExhaustion => {
            RecoveryStrategy::RetryWithBackoff
        }
        ErrorCategory::ExternalService if context.retries_exhausted() => RecoveryStrategy::Fallback,
        ErrorCategory::ExternalService => RecoveryStrategy::RetryWithBackoff,
        ErrorCategory::Validation | ErrorCategory::Unknown => RecoveryStrategy::Retry,
        ErrorCategory::Coordination if context.rollback_required => RecoveryStrategy::Rollback,
        ErrorCategory::Coordination => RecoveryStrategy::SimplifyWorkflow,
        ErrorCategory::SystemFailure => RecoveryStrategy::Escalate,
        ErrorCategory::Security => RecoveryStrategy::Abort,
    }
}

fn typed_category(error: &OpguardError) -> Option<ErrorCategory> {
    let category = match error {
        OpguardError::CircuitOpen { .. } => ErrorCategory::ExternalService,
        OpguardError::Cancelled {
            reason: CancelReason::Timeout,
            ..
        } => ErrorCategory::Timeout,
        OpguardError::Cancelled {
            reason: CancelReason::ResourceLimit,
            ..
        } => ErrorCategory::ResourceExhaustion,
        OpguardError::Cancelled { .. } => ErrorCategory::Coordination,
        OpguardError::Timeout { .. } => ErrorCategory::Timeout,
        OpguardError::CheckpointNotFound(_)
        | OpguardError::RollbackFailed { .. }
        | OpguardError::MissingStateAccessor(_)
        | OpguardError::Audit(_) => ErrorCategory::SystemFailure,
        OpguardError::OperationNotFound(_)
        | OpguardError::OperationExists(_)
        | OpguardError::OperationNotActive(_)
        | OpguardError::InvalidTransition { .. } => ErrorCategory::Coordination,
        OpguardError::Config(_) | OpguardError::Serialization(_) => ErrorCategory::Validation,
        OpguardError::Io(io) => return io_category(io.kind()),
        OpguardError::Action(_) => return None,
    };
    Some(category)
}

fn io_category(kind: ErrorKind) -> Option<ErrorCategory> {
    match kind {
        ErrorKind::TimedOut => Some(ErrorCategory::Timeout),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => Some(ErrorCategory::Network),
        ErrorKind::PermissionDenied => Some(ErrorCategory::Security),
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
            Some(ErrorCategory::Validation)
        }
        ErrorKind::OutOfMemory => Some(ErrorCategory::ResourceExhaustion),
        _ => None,
    }
}

/// Messages of `error` and its sources, outermost first
fn cause_chain(error: &OpguardError) -> Vec<String> {
    match error {
        OpguardError::Action(inner) => inner.chain().map(|c| c.to_string()).collect(),
        other => {
            let mut chain = vec![other.to_string()];
            let mut source = std::error::Error::source(other);
            while let Some(cause) = source {
                chain.push(cause.to_string());
                source = cause.source();
            }
            chain
        }
    }
}
