/// Retry policies keyed by operation type
///
/// Policies are immutable once registered. Updating a policy builds a new
/// value and swaps it in, so callers holding the old `Arc` keep a consistent
/// view for the rest of their run.
use super::backoff::{compute_delay, BackoffStrategy};
use crate::config::duration_format;
use crate::{OpguardError, OpguardResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Operation type used when nothing more specific is registered
pub const DEFAULT_OPERATION_TYPE: &str = "default";

/// Circuit breaker linkage for a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Whether attempts consult a breaker at all
    pub enabled: bool,

    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Consecutive half-open successes before the breaker closes
    pub success_threshold: u32,

    /// Time the breaker stays open before allowing trial attempts
    #[serde(with = "duration_format")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Retry policy for one operation type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Operation type this policy applies to
    pub operation_type: String,

    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay unit for the backoff strategy
    #[serde(with = "duration_format")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_format")]
    pub max_delay: Duration,

    pub backoff: BackoffStrategy,

    /// Growth factor for the exponential strategies
    pub multiplier: f64,

    /// Relative jitter range for `ExponentialJitter` (0.1 = ±10%)
    pub jitter: f64,

    /// Per-attempt time limit
    #[serde(with = "duration_format::option")]
    pub attempt_timeout: Option<Duration>,

    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            operation_type: DEFAULT_OPERATION_TYPE.to_string(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::ExponentialJitter,
            multiplier: 2.0,
            jitter: 0.1,
            attempt_timeout: Some(Duration::from_secs(60)),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

impl RetryPolicy {
    /// Default policy renamed for `operation_type`
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            ..Self::default()
        }
    }

    /// Preset for calls over an unreliable network
    pub fn network() -> Self {
        Self {
            operation_type: "network".to_string(),
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::ExponentialJitter,
            jitter: 0.2,
            attempt_timeout: Some(Duration::from_secs(30)),
            ..Self::default()
        }
    }

    /// Preset for third-party APIs (rate limited, slower to recover)
    pub fn external_api() -> Self {
        Self {
            operation_type: "external_api".to_string(),
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff: BackoffStrategy::ExponentialJitter,
            jitter: 0.25,
            attempt_timeout: Some(Duration::from_secs(45)),
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: 3,
                cooldown: Duration::from_secs(120),
                ..CircuitBreakerSettings::default()
            },
            ..Self::default()
        }
    }

    /// Preset for local storage access
    pub fn database() -> Self {
        Self {
            operation_type: "database".to_string(),
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff: BackoffStrategy::Linear,
            attempt_timeout: Some(Duration::from_secs(10)),
            ..Self::default()
        }
    }

    /// Preset for multi-agent hand-offs
    pub fn agent_coordination() -> Self {
        Self {
            operation_type: "agent_coordination".to_string(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
            backoff: BackoffStrategy::Fibonacci,
            attempt_timeout: Some(Duration::from_secs(120)),
            circuit_breaker: CircuitBreakerSettings::disabled(),
            ..Self::default()
        }
    }

    /// Builder-style override of the attempt count
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder-style override of the backoff shape
    pub fn with_backoff(mut self, strategy: BackoffStrategy, base: Duration, max: Duration) -> Self {
        self.backoff = strategy;
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, settings: CircuitBreakerSettings) -> Self {
        self.circuit_breaker = settings;
        self
    }

    /// Delay before retry number `retry` (the wait before attempt `retry + 1`)
    pub fn delay_for(&self, retry: u32) -> Duration {
        compute_delay(
            self.backoff,
            retry,
            self.base_delay,
            self.max_delay,
            self.multiplier,
            self.jitter,
        )
    }

    /// Delays before attempts 2..=max_attempts
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> OpguardResult<()> {
        if self.operation_type.trim().is_empty() {
            return Err(OpguardError::Config(
                "operation_type must not be empty".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(OpguardError::Config(format!(
                "{}: max_attempts must be at least 1",
                self.operation_type
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(OpguardError::Config(format!(
                "{}: max_delay ({:?}) is below base_delay ({:?})",
                self.operation_type, self.max_delay, self.base_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(OpguardError::Config(format!(
                "{}: jitter must be within 0..=1",
                self.operation_type
            )));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(OpguardError::Config(format!(
                "{}: multiplier must be >= 1",
                self.operation_type
            )));
        }
        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(OpguardError::Config(format!(
                "{}: circuit breaker failure_threshold must be at least 1",
                self.operation_type
            )));
        }
        Ok(())
    }
}

/// Partial policy update; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyUpdate {
    pub max_attempts: Option<u32>,
    #[serde(with = "duration_format::option")]
    pub base_delay: Option<Duration>,
    #[serde(with = "duration_format::option")]
    pub max_delay: Option<Duration>,
    pub backoff: Option<BackoffStrategy>,
    pub multiplier: Option<f64>,
    pub jitter: Option<f64>,
    /// `Some(None)` clears the per-attempt timeout
    #[serde(skip)]
    pub attempt_timeout: Option<Option<Duration>>,
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

impl PolicyUpdate {
    fn apply(self, policy: &RetryPolicy) -> RetryPolicy {
        let mut updated = policy.clone();
        if let Some(v) = self.max_attempts {
            updated.max_attempts = v;
        }
        if let Some(v) = self.base_delay {
            updated.base_delay = v;
        }
        if let Some(v) = self.max_delay {
            updated.max_delay = v;
        }
        if let Some(v) = self.backoff {
            updated.backoff = v;
        }
        if let Some(v) = self.multiplier {
            updated.multiplier = v;
        }
        if let Some(v) = self.jitter {
            updated.jitter = v;
        }
        if let Some(v) = self.attempt_timeout {
            updated.attempt_timeout = v;
        }
        if let Some(v) = self.circuit_breaker {
            updated.circuit_breaker = v;
        }
        updated
    }
}

/// Registry of policies by operation type
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<RetryPolicy>>>,
    default_policy: RwLock<Arc<RetryPolicy>>,
}

impl PolicyRegistry {
    /// Empty registry with the given fallback policy
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            default_policy: RwLock::new(Arc::new(default_policy)),
        }
    }

    /// Registry with the built-in presets installed
    pub fn with_presets() -> Self {
        let registry = Self::new(RetryPolicy::default());
        for policy in [
            RetryPolicy::network(),
            RetryPolicy::external_api(),
            RetryPolicy::database(),
            RetryPolicy::agent_coordination(),
        ] {
            registry.insert(policy);
        }
        registry
    }

    /// Register or replace the policy for its operation type
    pub fn set_policy(&self, policy: RetryPolicy) -> OpguardResult<()> {
        policy.validate()?;
        tracing::info!(
            operation_type = %policy.operation_type,
            max_attempts = policy.max_attempts,
            backoff = %policy.backoff,
            "Retry policy registered"
        );
        self.insert(policy);
        Ok(())
    }

    /// Apply a partial update to an existing policy
    ///
    /// Updating the default operation type changes the fallback policy.
    pub fn update_policy(&self, operation_type: &str, update: PolicyUpdate) -> OpguardResult<()> {
        let current = if operation_type == DEFAULT_OPERATION_TYPE {
            self.default_policy()
        } else {
            self.read_policies()
                .get(operation_type)
                .cloned()
                .ok_or_else(|| {
                    OpguardError::Config(format!(
                        "no retry policy registered for '{}'",
                        operation_type
                    ))
                })?
        };

        let updated = update.apply(&current);
        updated.validate()?;
        tracing::info!(operation_type = operation_type, "Retry policy updated");
        self.insert(updated);
        Ok(())
    }

    /// Replace the fallback policy
    pub fn set_default(&self, mut policy: RetryPolicy) -> OpguardResult<()> {
        policy.operation_type = DEFAULT_OPERATION_TYPE.to_string();
        policy.validate()?;
        *self
            .default_policy
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
        Ok(())
    }

    /// Policy for `operation_type`, falling back to the default
    pub fn get(&self, operation_type: &str) -> Arc<RetryPolicy> {
        self.read_policies()
            .get(operation_type)
            .cloned()
            .unwrap_or_else(|| self.default_policy())
    }

    /// Whether a dedicated policy exists for `operation_type`
    pub fn contains(&self, operation_type: &str) -> bool {
        self.read_policies().contains_key(operation_type)
    }

    pub fn remove(&self, operation_type: &str) -> bool {
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation_type)
            .is_some()
    }

    pub fn default_policy(&self) -> Arc<RetryPolicy> {
        Arc::clone(&self.default_policy.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// All registered policies sorted by operation type, default first
    pub fn all(&self) -> Vec<Arc<RetryPolicy>> {
        let mut policies: Vec<_> = self.read_policies().values().cloned().collect();
        policies.sort_by(|a, b| a.operation_type.cmp(&b.operation_type));
        policies.insert(0, self.default_policy());
        policies
    }

    fn insert(&self, policy: RetryPolicy) {
        if policy.operation_type == DEFAULT_OPERATION_TYPE {
            *self
                .default_policy
                .write()
                .unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
            return;
        }
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(policy.operation_type.clone(), Arc::new(policy));
    }

    fn read_policies(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<RetryPolicy>>> {
        self.policies.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_presets()
    }
}
