/// Backoff strategies mapping a retry number to the wait before it
///
/// Retry numbers start at 1: the delay before attempt `k` (k > 1) is
/// `compute_delay(strategy, k - 1, ...)`. Every strategy is capped at
/// `max_delay`.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Backoff family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base`
    Fixed,

    /// `base * n`
    Linear,

    /// `base * multiplier^(n-1)`
    Exponential,

    /// Exponential, then scaled by `1 + uniform(-jitter, +jitter)`
    ExponentialJitter,

    /// `base * fib(n)` with fib(1) = fib(2) = 1
    Fibonacci,
}

impl BackoffStrategy {
    pub const ALL: [BackoffStrategy; 5] = [
        BackoffStrategy::Fixed,
        BackoffStrategy::Linear,
        BackoffStrategy::Exponential,
        BackoffStrategy::ExponentialJitter,
        BackoffStrategy::Fibonacci,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::ExponentialJitter => "exponential_jitter",
            BackoffStrategy::Fibonacci => "fibonacci",
        }
    }

    /// Whether two calls with the same inputs return the same delay
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, BackoffStrategy::ExponentialJitter)
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed" | "constant" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" | "exp" => Ok(BackoffStrategy::Exponential),
            "exponential_jitter" | "jitter" => Ok(BackoffStrategy::ExponentialJitter),
            "fibonacci" | "fib" => Ok(BackoffStrategy::Fibonacci),
            other => Err(format!("unknown backoff strategy: {}", other)),
        }
    }
}

/// n-th Fibonacci number, saturating at `u64::MAX`
pub fn fibonacci(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let (mut prev, mut curr) = (0u64, 1u64);
    for _ in 1..n {
        let next = prev.saturating_add(curr);
        prev = curr;
        curr = next;
    }
    curr
}

/// Delay before retry number `retry` (1-based)
///
/// `multiplier` below 1.0 is treated as 1.0 and `jitter` is clamped to
/// `[0.0, 1.0]`.
pub fn compute_delay(
    strategy: BackoffStrategy,
    retry: u32,
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
) -> Duration {
    let n = retry.max(1);
    let base_secs = base.as_secs_f64();
    let max_secs = max.as_secs_f64();
    let multiplier = if multiplier.is_finite() {
        multiplier.max(1.0)
    } else {
        1.0
    };

    let raw = match strategy {
        BackoffStrategy::Fixed => base_secs,
        BackoffStrategy::Linear => base_secs * n as f64,
        BackoffStrategy::Exponential => base_secs * multiplier.powi(exponent(n)),
        BackoffStrategy::ExponentialJitter => {
            let exp = base_secs * multiplier.powi(exponent(n));
            // Cap before jitter so the spread stays centred on the capped value
            let capped = exp.min(max_secs);
            let range = if jitter.is_finite() {
                jitter.clamp(0.0, 1.0)
            } else {
                0.0
            };
            if range > 0.0 {
                let factor = rand::thread_rng().gen_range(-range..=range);
                capped * (1.0 + factor)
            } else {
                capped
            }
        }
        BackoffStrategy::Fibonacci => base_secs * fibonacci(n) as f64,
    };

    let secs = if raw.is_finite() {
        raw.clamp(0.0, max_secs)
    } else {
        max_secs
    };
    Duration::from_secs_f64(secs)
}

fn exponent(n: u32) -> i32 {
    i32::try_from(n - 1).unwrap_or(i32::MAX)
}
