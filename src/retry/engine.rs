/// Retry engine
///
/// Wraps an async, cancellation-aware action in a retry loop driven by the
/// policy registered for the operation type. Before every attempt the
/// service's circuit breaker is consulted; the backoff wait and the attempt
/// itself both race the operation's cancellation token.
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use super::policy::{PolicyRegistry, RetryPolicy};
use super::worker_pool::WorkerPool;
use crate::cancellation::CancellationToken;
use crate::{OpguardError, OpguardResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Default number of attempt records kept in the log
pub const DEFAULT_ATTEMPT_LOG_CAPACITY: usize = 1000;

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
    CircuitOpen,
    Cancelled,
}

/// One attempt, as recorded in the attempt log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub operation_type: String,
    pub service: String,

    /// 1-based attempt number
    pub attempt: u32,

    pub outcome: AttemptOutcome,

    /// Backoff waited before this attempt
    pub delay_before: Duration,

    /// Time spent in the action
    pub elapsed: Duration,

    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Per operation type counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    /// `run_with_retry` calls
    pub operations: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,

    /// Individual attempts that reached the action
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub circuit_rejections: u64,
    pub cancellations: u64,

    /// Sum of all backoff waits
    pub total_delay: Duration,
}

impl RetryStats {
    /// Successful attempts over all attempts (1.0 when nothing ran)
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 1.0;
        }
        self.successes as f64 / self.attempts as f64
    }

    fn merge(&mut self, other: &RetryStats) {
        self.operations += other.operations;
        self.operations_succeeded += other.operations_succeeded;
        self.operations_failed += other.operations_failed;
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.circuit_rejections += other.circuit_rejections;
        self.cancellations += other.cancellations;
        self.total_delay += other.total_delay;
    }
}

enum Attempt<T> {
    Finished(anyhow::Result<T>),
    TimedOut(Duration),
    Cancelled,
}

/// Retry engine
pub struct RetryEngine {
    policies: Arc<PolicyRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    pool: Arc<WorkerPool>,
    stats: Mutex<HashMap<String, RetryStats>>,
    attempt_log: Mutex<VecDeque<AttemptRecord>>,
    attempt_log_capacity: usize,
}

impl RetryEngine {
    pub fn new(
        policies: Arc<PolicyRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            policies,
            breakers,
            pool,
            stats: Mutex::new(HashMap::new()),
            attempt_log: Mutex::new(VecDeque::new()),
            attempt_log_capacity: DEFAULT_ATTEMPT_LOG_CAPACITY,
        }
    }

    pub fn with_attempt_log_capacity(mut self, capacity: usize) -> Self {
        self.attempt_log_capacity = capacity;
        self
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Breaker guarding `service` under the policy for `operation_type`, if
    /// that policy links one
    pub fn breaker_for(&self, operation_type: &str, service: &str) -> Option<Arc<CircuitBreaker>> {
        let policy = self.policies.get(operation_type);
        policy
            .circuit_breaker
            .enabled
            .then(|| self.breakers.get_or_create(service, &policy.circuit_breaker))
    }

    /// Run `action` under the policy for `operation_type`, retrying every
    /// failure
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        operation_type: &str,
        service: &str,
        token: &CancellationToken,
        action: F,
    ) -> OpguardResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_with_retry_when(operation_type, service, token, |_| true, action)
            .await
    }

    /// Like [`run_with_retry`](Self::run_with_retry), but an error for which
    /// `retryable` returns false ends the loop immediately
    pub async fn run_with_retry_when<T, F, Fut, P>(
        &self,
        operation_type: &str,
        service: &str,
        token: &CancellationToken,
        retryable: P,
        mut action: F,
    ) -> OpguardResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        P: Fn(&anyhow::Error) -> bool,
    {
        let policy = self.policies.get(operation_type);
        let breaker = self.breaker_for(operation_type, service);
        let max_attempts = policy.max_attempts.max(1);

        self.update_stats(operation_type, |s| s.operations += 1);

        let mut last_error: Option<OpguardError> = None;

        for attempt in 1..=max_attempts {
            let mut delay = Duration::ZERO;
            if attempt > 1 {
                delay = policy.delay_for(attempt - 1);
                tracing::debug!(
                    operation_type = operation_type,
                    service = service,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before retry"
                );
                self.update_stats(operation_type, |s| s.total_delay += delay);

                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if token.is_cancelled() {
                return Err(self.cancelled(operation_type, service, attempt, delay, token));
            }

            if let Some(breaker) = &breaker {
                if !breaker.can_proceed() {
                    tracing::warn!(
                        operation_type = operation_type,
                        service = service,
                        attempt,
                        "Circuit breaker open, attempt rejected"
                    );
                    self.update_stats(operation_type, |s| {
                        s.circuit_rejections += 1;
                        s.operations_failed += 1;
                    });
                    self.log_attempt(AttemptRecord {
                        operation_type: operation_type.to_string(),
                        service: service.to_string(),
                        attempt,
                        outcome: AttemptOutcome::CircuitOpen,
                        delay_before: delay,
                        elapsed: Duration::ZERO,
                        error: None,
                        at: Utc::now(),
                    });
                    return Err(OpguardError::CircuitOpen {
                        service: service.to_string(),
                    });
                }
            }

            let started = Instant::now();
            let attempt_result = Self::attempt(&policy, token, action(token.clone())).await;
            let elapsed = started.elapsed();

            let mut record = AttemptRecord {
                operation_type: operation_type.to_string(),
                service: service.to_string(),
                attempt,
                outcome: AttemptOutcome::Success,
                delay_before: delay,
                elapsed,
                error: None,
                at: Utc::now(),
            };

            match attempt_result {
                Attempt::Finished(Ok(value)) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    self.update_stats(operation_type, |s| {
                        s.attempts += 1;
                        s.successes += 1;
                        s.operations_succeeded += 1;
                    });
                    self.log_attempt(record);
                    if attempt > 1 {
                        tracing::info!(
                            operation_type = operation_type,
                            service = service,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Attempt::Cancelled => {
                    if let Some(breaker) = &breaker {
                        breaker.release_trial();
                    }
                    return Err(self.cancelled(operation_type, service, attempt, delay, token));
                }
                Attempt::Finished(Err(error)) => {
                    // The action stopped because it observed this operation's token.
                    // A cancellation error from some other token is an ordinary failure.
                    if token.is_cancelled() {
                        if let Some(breaker) = &breaker {
                            breaker.release_trial();
                        }
                        return Err(self.cancelled(operation_type, service, attempt, delay, token));
                    }

                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                    self.update_stats(operation_type, |s| {
                        s.attempts += 1;
                        s.failures += 1;
                    });
                    record.outcome = AttemptOutcome::Failure;
                    record.error = Some(format!("{:#}", error));
                    self.log_attempt(record);

                    let retry = retryable(&error);
                    tracing::warn!(
                        operation_type = operation_type,
                        service = service,
                        attempt,
                        max_attempts,
                        retryable = retry,
                        error = %error,
                        "Attempt failed"
                    );

                    if !retry {
                        self.update_stats(operation_type, |s| s.operations_failed += 1);
                        return Err(OpguardError::from(error));
                    }
                    last_error = Some(OpguardError::from(error));
                }
                Attempt::TimedOut(limit) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                    self.update_stats(operation_type, |s| {
                        s.attempts += 1;
                        s.failures += 1;
                        s.timeouts += 1;
                    });
                    record.outcome = AttemptOutcome::Timeout;
                    record.error = Some(format!("timed out after {:?}", limit));
                    self.log_attempt(record);

                    tracing::warn!(
                        operation_type = operation_type,
                        service = service,
                        attempt,
                        max_attempts,
                        timeout_ms = limit.as_millis() as u64,
                        "Attempt timed out"
                    );
                    last_error = Some(OpguardError::Timeout {
                        operation: operation_type.to_string(),
                        after: limit,
                    });
                }
            }
        }

        self.update_stats(operation_type, |s| s.operations_failed += 1);
        tracing::error!(
            operation_type = operation_type,
            service = service,
            max_attempts,
            "Retry attempts exhausted"
        );

        Err(last_error.unwrap_or_else(|| {
            OpguardError::Config(format!(
                "retry policy '{}' allowed no attempts",
                policy.operation_type
            ))
        }))
    }

    /// Run a blocking closure with retries, each attempt on the worker pool
    pub async fn run_blocking_with_retry<T, F>(
        &self,
        operation_type: &str,
        service: &str,
        token: &CancellationToken,
        job: F,
    ) -> OpguardResult<T>
    where
        F: Fn(CancellationToken) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let job = Arc::new(job);
        let pool = Arc::clone(&self.pool);
        self.run_with_retry(operation_type, service, token, move |token| {
            let job = Arc::clone(&job);
            let pool = Arc::clone(&pool);
            async move { pool.run(move || (*job)(token)).await }
        })
        .await
    }

    /// Counters for one operation type
    pub fn stats_for(&self, operation_type: &str) -> RetryStats {
        self.lock_stats()
            .get(operation_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Counters for every operation type seen so far
    pub fn stats(&self) -> HashMap<String, RetryStats> {
        self.lock_stats().clone()
    }

    /// Counters summed across operation types
    pub fn total_stats(&self) -> RetryStats {
        let mut total = RetryStats::default();
        for stats in self.lock_stats().values() {
            total.merge(stats);
        }
        total
    }

    /// Most recent attempt records, newest last
    pub fn recent_attempts(&self, limit: usize) -> Vec<AttemptRecord> {
        let log = self.attempt_log.lock().unwrap_or_else(|e| e.into_inner());
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    pub fn reset_stats(&self) {
        self.lock_stats().clear();
        self.attempt_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    async fn attempt<T, Fut>(policy: &RetryPolicy, token: &CancellationToken, fut: Fut) -> Attempt<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let run = async {
            match policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => Attempt::Finished(result),
                    Err(_) => Attempt::TimedOut(limit),
                },
                None => Attempt::Finished(fut.await),
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Attempt::Cancelled,
            result = run => result,
        }
    }

    fn cancelled(
        &self,
        operation_type: &str,
        service: &str,
        attempt: u32,
        delay: Duration,
        token: &CancellationToken,
    ) -> OpguardError {
        self.update_stats(operation_type, |s| {
            s.cancellations += 1;
            s.operations_failed += 1;
        });
        self.log_attempt(AttemptRecord {
            operation_type: operation_type.to_string(),
            service: service.to_string(),
            attempt,
            outcome: AttemptOutcome::Cancelled,
            delay_before: delay,
            elapsed: Duration::ZERO,
            error: None,
            at: Utc::now(),
        });
        tracing::info!(
            operation_id = %token.operation_id(),
            operation_type = operation_type,
            attempt,
            "Retry loop stopped by cancellation"
        );
        token.cancellation_error()
    }

    fn update_stats<F>(&self, operation_type: &str, f: F)
    where
        F: FnOnce(&mut RetryStats),
    {
        let mut stats = self.lock_stats();
        f(stats.entry(operation_type.to_string()).or_default());
    }

    fn log_attempt(&self, record: AttemptRecord) {
        if self.attempt_log_capacity == 0 {
            return;
        }
        let mut log = self.attempt_log.lock().unwrap_or_else(|e| e.into_inner());
        while log.len() >= self.attempt_log_capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryStats>> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(
            Arc::new(PolicyRegistry::default()),
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(WorkerPool::default()),
        )
    }
}
