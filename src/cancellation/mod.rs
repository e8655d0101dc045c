/// Cancellation tokens, progress tracking and the operation orchestrator
///
/// Every operation gets exactly one [`CancellationToken`] when it starts.
/// Business logic observes it at each suspension point, either by awaiting
/// [`CancellationToken::cancelled`] inside `select!` or by calling
/// [`CancellationToken::check`] between steps.
pub mod orchestrator;
pub mod progress;
pub mod token;

pub use orchestrator::{
    CancelReport, CancellationScope, OperationOrchestrator, OrchestratorStats, StartOptions,
    DEFAULT_HISTORY_LIMIT,
};
pub use progress::{OperationProgress, OperationState, ProgressUpdate};
pub use token::{CancelReason, CancellationDetails, CancellationToken};
