/// Retry engine, backoff strategies, policies and circuit breakers
///
/// ```ignore
/// let engine = RetryEngine::default();
/// let token = CancellationToken::new("op-42");
///
/// let quotes = engine
///     .run_with_retry("external_api", "market-data", &token, |token| async move {
///         token.check()?;
///         fetch_quotes().await
///     })
///     .await?;
/// ```
pub mod backoff;
pub mod circuit_breaker;
pub mod engine;
pub mod policy;
pub mod worker_pool;

pub use backoff::{compute_delay, fibonacci, BackoffStrategy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitStatus,
};
pub use engine::{
    AttemptOutcome, AttemptRecord, RetryEngine, RetryStats, DEFAULT_ATTEMPT_LOG_CAPACITY,
};
pub use policy::{
    CircuitBreakerSettings, PolicyRegistry, PolicyUpdate, RetryPolicy, DEFAULT_OPERATION_TYPE,
};
pub use worker_pool::WorkerPool;
