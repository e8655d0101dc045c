/// Per-service circuit breakers
///
/// States:
/// - Closed: normal operation, attempts pass through
/// - Open: too many consecutive failures, fail fast until the cooldown elapses
/// - HalfOpen: a bounded number of trial attempts test whether the service
///   recovered; enough consecutive successes close the circuit, any failure
///   reopens it
use super::policy::CircuitBreakerSettings;
use crate::config::duration_format;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Normal operation
    Closed,

    /// Too many failures, fail fast
    Open,

    /// Testing if the service recovered
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct CircuitState {
    /// Current circuit state
    status: CircuitStatus,

    /// Consecutive failure count
    failure_count: u32,

    /// Consecutive success count (in half-open state)
    success_count: u32,

    /// Trial attempts currently admitted in half-open state
    trials_in_flight: u32,

    /// When circuit was opened
    opened_at: Option<Instant>,

    last_failure_at: Option<DateTime<Utc>>,

    last_success_at: Option<DateTime<Utc>>,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            success_count: 0,
            trials_in_flight: 0,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    fn open(&mut self) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
        self.trials_in_flight = 0;
    }

    fn close(&mut self) {
        self.status = CircuitStatus::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.trials_in_flight = 0;
        self.opened_at = None;
    }

    fn half_open(&mut self) {
        self.status = CircuitStatus::HalfOpen;
        self.success_count = 0;
        self.trials_in_flight = 0;
    }
}

/// Serializable view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,

    /// Time left before an open breaker admits a trial attempt
    #[serde(with = "duration_format::option")]
    pub cooldown_remaining: Option<Duration>,
}

/// Thresholds and cooldown of a breaker; replaceable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BreakerLimits {
    /// Number of failures before opening circuit
    failure_threshold: u32,

    /// Number of successes needed to close circuit
    success_threshold: u32,

    /// Time to wait before transitioning to half-open
    cooldown: Duration,
}

impl BreakerLimits {
    fn new(failure_threshold: u32, success_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            cooldown,
        }
    }

    fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self::new(
            settings.failure_threshold,
            settings.success_threshold,
            settings.cooldown,
        )
    }
}

/// Circuit breaker for one named service
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,

    /// Read before `state` is locked, never while it is held
    limits: RwLock<BreakerLimits>,

    /// Internal state (protected by mutex)
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(
        service: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            limits: RwLock::new(BreakerLimits::new(
                failure_threshold,
                success_threshold,
                cooldown,
            )),
            state: Mutex::new(CircuitState::closed()),
        }
    }

    pub fn from_settings(service: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self::new(
            service,
            settings.failure_threshold,
            settings.success_threshold,
            settings.cooldown,
        )
    }

    /// Apply new thresholds and cooldown; the current state is kept
    ///
    /// Returns false when the settings already matched.
    pub fn update_settings(&self, settings: &CircuitBreakerSettings) -> bool {
        let next = BreakerLimits::from_settings(settings);
        let mut limits = self.limits.write().unwrap_or_else(|e| e.into_inner());
        if *limits == next {
            return false;
        }
        *limits = next;
        drop(limits);
        tracing::info!(
            service = %self.service,
            failure_threshold = next.failure_threshold,
            success_threshold = next.success_threshold,
            cooldown_ms = next.cooldown.as_millis() as u64,
            "Circuit breaker settings updated"
        );
        true
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether an attempt may run now
    ///
    /// An open breaker whose cooldown elapsed moves to half-open. Half-open
    /// admits at most `success_threshold` concurrent trial attempts; every
    /// admitted trial must be settled with `record_success`,
    /// `record_failure` or `release_trial`.
    pub fn can_proceed(&self) -> bool {
        let limits = self.limits();
        let mut state = self.lock();

        match state.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= limits.cooldown {
                    state.half_open();
                    state.trials_in_flight = 1;
                    tracing::info!(service = %self.service, "Circuit breaker transitioning to HalfOpen");
                    true
                } else {
                    false
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trials_in_flight < limits.success_threshold {
                    state.trials_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record successful operation
    pub fn record_success(&self) {
        let limits = self.limits();
        let mut state = self.lock();
        state.last_success_at = Some(Utc::now());

        match state.status {
            CircuitStatus::Closed => {
                state.failure_count = 0;
            }
            CircuitStatus::HalfOpen => {
                state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
                state.success_count += 1;
                if state.success_count >= limits.success_threshold {
                    state.close();
                    tracing::info!(
                        service = %self.service,
                        successes = limits.success_threshold,
                        "Circuit breaker CLOSED"
                    );
                }
            }
            CircuitStatus::Open => {
                // Late result of an attempt admitted before the breaker opened
                tracing::debug!(service = %self.service, "Success recorded while circuit is OPEN");
            }
        }
    }

    /// Record failed operation
    pub fn record_failure(&self) {
        let limits = self.limits();
        let mut state = self.lock();
        state.last_failure_at = Some(Utc::now());

        match state.status {
            CircuitStatus::Closed => {
                state.failure_count += 1;
                if state.failure_count >= limits.failure_threshold {
                    state.open();
                    tracing::warn!(
                        service = %self.service,
                        failures = state.failure_count,
                        "Circuit breaker OPENED"
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                state.failure_count += 1;
                state.open();
                tracing::warn!(service = %self.service, "Circuit breaker REOPENED after failure in HalfOpen state");
            }
            CircuitStatus::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// Give back a half-open trial slot without an outcome (cancelled attempt)
    pub fn release_trial(&self) {
        let mut state = self.lock();
        if state.status == CircuitStatus::HalfOpen {
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }
    }

    /// Force the breaker into `status`, bypassing thresholds
    pub fn force_state(&self, status: CircuitStatus) {
        let mut state = self.lock();
        match status {
            CircuitStatus::Open => state.open(),
            CircuitStatus::Closed => state.close(),
            CircuitStatus::HalfOpen => state.half_open(),
        }
        tracing::info!(service = %self.service, status = %status, "Circuit breaker state forced");
    }

    /// Reset circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = CircuitState::closed();
        tracing::info!(service = %self.service, "Circuit breaker manually reset to CLOSED");
    }

    /// Get current circuit status
    pub fn status(&self) -> CircuitStatus {
        self.lock().status
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        matches!(self.lock().status, CircuitStatus::Open)
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let limits = self.limits();
        let state = self.lock().clone();
        let cooldown_remaining = match (state.status, state.opened_at) {
            (CircuitStatus::Open, Some(opened_at)) => {
                Some(limits.cooldown.saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        };

        CircuitBreakerSnapshot {
            service: self.service.clone(),
            status: state.status,
            consecutive_failures: state.failure_count,
            half_open_successes: state.success_count,
            failure_threshold: limits.failure_threshold,
            success_threshold: limits.success_threshold,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            cooldown_remaining,
        }
    }

    fn limits(&self) -> BreakerLimits {
        *self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Breakers by service name, created on first use
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_settings: CircuitBreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new(default_settings: CircuitBreakerSettings) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_settings,
        }
    }

    /// Breaker for `service`, created with `settings` if it does not exist
    ///
    /// An existing breaker takes over `settings` when they changed, so a
    /// policy update reaches breakers already in use.
    pub fn get_or_create(
        &self,
        service: &str,
        settings: &CircuitBreakerSettings,
    ) -> Arc<CircuitBreaker> {
        let breaker = self.entry(service, settings);
        breaker.update_settings(settings);
        breaker
    }

    /// Apply `settings` to the breaker for `service`; false if none exists
    pub fn update_settings(&self, service: &str, settings: &CircuitBreakerSettings) -> bool {
        match self.get(service) {
            Some(breaker) => {
                breaker.update_settings(settings);
                true
            }
            None => false,
        }
    }

    fn entry(&self, service: &str, settings: &CircuitBreakerSettings) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(service) {
            return breaker;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(breakers.entry(service.to_string()).or_insert_with(|| {
            tracing::debug!(service = service, "Circuit breaker created");
            Arc::new(CircuitBreaker::from_settings(service, settings))
        }))
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
    }

    /// Force a service breaker open or closed, creating it with the default
    /// settings if needed
    pub fn force_state(&self, service: &str, status: CircuitStatus) {
        self.entry(service, &self.default_settings).force_state(status);
    }

    /// Reset every breaker to closed
    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }

    /// Snapshots of every breaker, sorted by service name
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.all().iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    /// Names of services whose breaker is currently open
    pub fn open_services(&self) -> Vec<String> {
        let mut open: Vec<_> = self
            .all()
            .iter()
            .filter(|b| b.is_open())
            .map(|b| b.service().to_string())
            .collect();
        open.sort();
        open
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}
