//! Retry policy
//!
//! Supports exponential backoff with jitter to avoid thundering herd.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::graph::types::TypeRegistry;
use crate::step::StepError;

/// Configuration for step retries
///
/// # Example
///
/// ```
/// use stepgraph::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_delay(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(60));
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Base delay before the first retry
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_multiplier: f64,

    /// Cap on the computed delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter as a fraction of the delay, uniform in both directions
    ///
    /// `None` falls back to the engine's configured default.
    pub jitter_factor: Option<f64>,

    /// Error type tags that trigger retry (empty = retry all)
    #[serde(default)]
    pub retry_on: Vec<String>,

    /// Error type tags that skip retry (wins over `retry_on`)
    #[serde(default)]
    pub abort_on: Vec<String>,

    /// Whether a `Fail` result (as opposed to a panic) is retried
    #[serde(default)]
    pub retry_on_fail_result: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second base delay
    /// - 60 second delay cap
    /// - 2x backoff multiplier
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_factor: None,
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter_factor: Some(0.0),
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// Fixed intervals (no backoff)
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            jitter_factor: Some(0.0),
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// Set the maximum number of attempts (floored at 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff multiplier (floored at 1.0)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter_factor = Some(jitter.clamp(0.0, 1.0));
        self
    }

    /// Add an error type tag that triggers retry
    pub fn with_retry_on(mut self, error_type: impl Into<String>) -> Self {
        self.retry_on.push(error_type.into());
        self
    }

    /// Add an error type tag that aborts retrying
    pub fn with_abort_on(mut self, error_type: impl Into<String>) -> Self {
        self.abort_on.push(error_type.into());
        self
    }

    /// Count plain `Fail` results as retryable attempts
    pub fn with_retry_on_fail_result(mut self, enabled: bool) -> Self {
        self.retry_on_fail_result = enabled;
        self
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 has no delay)
    pub fn delay_for_attempt(&self, attempt: u32, default_jitter: f64) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // First retry is after attempt 1
        let base =
            self.delay.as_secs_f64() * self.backoff_multiplier.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter_factor.unwrap_or(default_jitter).clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether an error should be retried under this policy
    ///
    /// `abort_on` wins over `retry_on`; an empty `retry_on` retries all.
    /// Matching is assignability over the declared type registry, so an
    /// abort list entry also covers its declared subtypes.
    pub fn should_retry(&self, error: &StepError, types: &TypeRegistry) -> bool {
        let error_type = error.error_type.as_deref();

        if let Some(tag) = error_type {
            if self
                .abort_on
                .iter()
                .any(|abort| types.is_assignable(tag, abort))
            {
                return false;
            }
        }

        if self.retry_on.is_empty() {
            return true;
        }

        match error_type {
            Some(tag) => self
                .retry_on
                .iter()
                .any(|retry| types.is_assignable(tag, retry)),
            None => false,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(1));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(!policy.retry_on_fail_result);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_for_attempt(2, 0.0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3, 0.0), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2, 0.0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(10, 0.0), Duration::from_secs(5));
    }

    #[test]
    fn test_default_jitter_applies_when_omitted() {
        let policy = RetryPolicy::exponential(); // jitter_factor = None
        let delay = policy.delay_for_attempt(2, 0.5);

        // With 50% jitter the delay lands somewhere in [0.5s, 1.5s)
        assert!(delay >= Duration::from_millis(500));
        assert!(delay < Duration::from_millis(1500));
    }

    #[test]
    fn test_retry_and_abort_lists() {
        let types = TypeRegistry::new();
        let policy = RetryPolicy::exponential()
            .with_retry_on("timeout")
            .with_abort_on("invalid_input");

        let timeout = StepError::transient("t").with_type("timeout");
        let invalid = StepError::transient("i").with_type("invalid_input");
        let other = StepError::transient("o").with_type("other");

        assert!(policy.should_retry(&timeout, &types));
        assert!(!policy.should_retry(&invalid, &types));
        assert!(!policy.should_retry(&other, &types));
    }

    #[test]
    fn test_abort_wins_over_retry() {
        let types = TypeRegistry::new();
        let policy = RetryPolicy::exponential()
            .with_retry_on("io_error")
            .with_abort_on("io_error");

        let error = StepError::transient("x").with_type("io_error");
        assert!(!policy.should_retry(&error, &types));
    }

    #[test]
    fn test_empty_retry_on_retries_all() {
        let types = TypeRegistry::new();
        let policy = RetryPolicy::exponential();

        assert!(policy.should_retry(&StepError::transient("anything"), &types));
    }

    #[test]
    fn test_abort_matches_subtypes() {
        let mut types = TypeRegistry::new();
        types.declare("connection_refused", "io_error").unwrap();

        let policy = RetryPolicy::exponential().with_abort_on("io_error");
        let error = StepError::transient("x").with_type("connection_refused");
        assert!(!policy.should_retry(&error, &types));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_retry_on("timeout")
            .with_retry_on_fail_result(true);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
