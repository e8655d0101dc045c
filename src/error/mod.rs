/// Unified error handling for operation failures
///
/// This module turns terminal failures into structured, user-facing
/// responses:
/// - Classification: maps raw errors to a category and severity
/// - Handlers: priority-ordered chain producing an [`ErrorResponse`]
/// - Coordinator: history, escalation, category breakers and rollback
/// - Audit: optional durable log of every handled error
///
/// # Usage Example
///
/// ```rust,ignore
/// use opguard::error::{ErrorContext, UnifiedErrorCoordinator};
///
/// let coordinator = UnifiedErrorCoordinator::default();
///
/// if let Err(e) = fetch_filings().await {
///     let response = coordinator.handle_error(
///         e,
///         ErrorContext::for_operation("op-42").with_service("filings"),
///     );
///     if response.retry_allowed {
///         // offer a retry button
///     }
/// }
/// ```
pub mod audit;
pub mod classification;
pub mod coordinator;
pub mod handlers;
pub mod record;

pub use audit::{AuditEntry, AuditLog, SqliteAuditLog};
pub use classification::{base_severity, ErrorClassifier};
pub use coordinator::{CoordinatorSettings, CoordinatorStats, UnifiedErrorCoordinator};
pub use handlers::{
    builtin_handlers, CoordinationHandler, DefaultHandler, ErrorHandler, ErrorResponse,
    FnHandler, NetworkHandler, RecoveryDirective, SecurityHandler, SystemFailureHandler,
    ValidationHandler,
};
pub use record::{ErrorCategory, ErrorContext, ErrorRecord, ErrorSeverity, RecoveryStrategy};
