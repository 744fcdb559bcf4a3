//! Retry policy for provider calls and tool invocations

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded retry policy with exponential backoff and jitter
///
/// `max_attempts` counts the initial call, so `max_attempts = 1` never retries.
///
/// ```
/// use runloop_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(500))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 doubles each retry)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.2 means up to ±20% per delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 4 attempts, 500ms doubling up to 8s, 20% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(8),
            backoff_coefficient: 2.0,
            jitter: 0.2,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before `attempt` (1-based); the first attempt has none
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).clamp(0.0, self.max_interval.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Delay before `attempt`, honoring a provider-supplied minimum (e.g. Retry-After)
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match hint {
            Some(hint) => delay.max(hint.min(self.max_interval)),
            None => delay,
        }
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
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
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(1))
            .with_jitter(0.5);

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_retry_after_hint_is_a_floor() {
        let policy = RetryPolicy::fixed(Duration::from_millis(100), 3);
        assert_eq!(
            policy.delay_with_hint(2, Some(Duration::from_millis(300))),
            Duration::from_millis(100)
        );
        let policy = policy.with_max_interval(Duration::from_secs(1));
        assert_eq!(
            policy.delay_with_hint(2, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250), 2);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_interval"], 250);

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);
    }
}
