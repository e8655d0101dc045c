/// Structured error records and the context callers attach to failures
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    SystemFailure,
    ResourceExhaustion,
    Network,
    Timeout,
    Coordination,
    Validation,
    ExternalService,
    Security,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::SystemFailure,
        ErrorCategory::ResourceExhaustion,
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Coordination,
        ErrorCategory::Validation,
        ErrorCategory::ExternalService,
        ErrorCategory::Security,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::SystemFailure => "system_failure",
            ErrorCategory::ResourceExhaustion => "resource_exhaustion",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Coordination => "coordination",
            ErrorCategory::Validation => "validation",
            ErrorCategory::ExternalService => "external_service",
            ErrorCategory::Security => "security",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Categories worth retrying locally before surfacing
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::ExternalService
                | ErrorCategory::ResourceExhaustion
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity, ordered from `Info` (lowest) to `Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub const ALL: [ErrorSeverity; 5] = [
        ErrorSeverity::Info,
        ErrorSeverity::Low,
        ErrorSeverity::Medium,
        ErrorSeverity::High,
        ErrorSeverity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Info => "info",
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }

    /// Next level up, saturating at `Critical`
    pub fn raised(self) -> Self {
        match self {
            ErrorSeverity::Info => ErrorSeverity::Low,
            ErrorSeverity::Low => ErrorSeverity::Medium,
            ErrorSeverity::Medium => ErrorSeverity::High,
            ErrorSeverity::High | ErrorSeverity::Critical => ErrorSeverity::Critical,
        }
    }

    /// Severities that allow an automatic rollback
    pub fn warrants_rollback(&self) -> bool {
        *self >= ErrorSeverity::High
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery strategy tag attached at classification time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    RetryWithBackoff,
    Rollback,
    Fallback,
    SimplifyWorkflow,
    Escalate,
    Abort,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::RetryWithBackoff => "retry_with_backoff",
            RecoveryStrategy::Rollback => "rollback",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::SimplifyWorkflow => "simplify_workflow",
            RecoveryStrategy::Escalate => "escalate",
            RecoveryStrategy::Abort => "abort",
        };
        f.write_str(s)
    }
}

/// Caller-supplied context for a failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation_id: Option<String>,

    /// Agent that raised the error
    pub agent_id: Option<String>,

    /// Operation type ("external_api", "document_update", ...)
    pub operation_type: Option<String>,

    /// External service involved, if any
    pub service: Option<String>,

    /// Checkpoint to roll back to instead of the operation's latest
    pub checkpoint_id: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Roll back even when severity alone would not
    pub rollback_required: bool,

    /// Record touches privacy/compliance-relevant data
    pub privacy_sensitive: bool,

    /// Overrides the classifier's category
    pub category: Option<ErrorCategory>,

    /// Overrides the classifier's severity
    pub severity: Option<ErrorSeverity>,

    /// Arbitrary structured context
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_operation(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: Some(operation_id.into()),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = retry_count;
        self.max_retries = max_retries;
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = Some(severity);
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

    /// Add metadata to the context
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the local retry budget is used up
    pub fn retries_exhausted(&self) -> bool {
        self.max_retries > 0 && self.retry_count >= self.max_retries
    }
}

/// Normalized, immutable description of one failure
///
/// Only `recovery_attempted` and `recovery_successful` change after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique error identifier (UUID)
    pub id: String,

    pub category: ErrorCategory,
    pub severity: ErrorSeverity,

    /// Human-readable message (outermost error)
    pub message: String,

    /// Full cause chain, outermost first
    pub causes: Vec<String>,

    pub operation_id: Option<String>,
    pub agent_id: Option<String>,
    pub operation_type: Option<String>,
    pub service: Option<String>,

    /// Caller metadata
    pub context: serde_json::Value,

    pub retry_count: u32,
    pub max_retries: u32,

    pub recovery_strategy: RecoveryStrategy,

    /// Earlier errors of the same operation within the correlation window
    pub related_errors: Vec<String>,

    pub privacy_sensitive: bool,

    pub created_at: DateTime<Utc>,

    pub recovery_attempted: bool,
    pub recovery_successful: Option<bool>,
}

impl ErrorRecord {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
        context: &ErrorContext,
    ) -> Self {
        let message = message.into();
        Self {
            id: Uuid::new_v4().to_string(),
            category,
            severity,
            causes: vec![message.clone()],
            message,
            operation_id: context.operation_id.clone(),
            agent_id: context.agent_id.clone(),
            operation_type: context.operation_type.clone(),
            service: context.service.clone(),
            context: serde_json::Value::Object(context.metadata.clone()),
            retry_count: context.retry_count,
            max_retries: context.max_retries,
            recovery_strategy: RecoveryStrategy::Retry,
            related_errors: Vec::new(),
            privacy_sensitive: context.privacy_sensitive,
            created_at: Utc::now(),
            recovery_attempted: false,
            recovery_successful: None,
        }
    }

    /// Short id used in support references and logs
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    pub(crate) fn mark_recovery(&mut self, successful: bool) {
        self.recovery_attempted = true;
        self.recovery_successful = Some(successful);
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} error: {}",
            self.short_id(),
            self.severity,
            self.category,
            self.message
        )?;
        if let Some(op) = &self.operation_id {
            write!(f, " (operation {})", op)?;
        }
        Ok(())
    }
}
