//! Retry backoff policy for failed webhook processing.

use chrono::{DateTime, Duration, Utc};

/// Exponential backoff with a hard cap and a bounded attempt budget.
///
/// Delays double per attempt: `base * 2^(attempt - 1)`, clamped to `cap`.
/// With the defaults (5 minute base, 60 minute cap, 3 attempts) the deltas
/// are 5, 10, and 20 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::seconds(300),
            cap: Duration::seconds(3600),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base,
            cap,
        }
    }

    /// Delay to wait after a failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        // Large attempt counts would overflow the multiply; the cap makes the
        // exact factor irrelevant past 2^30 anyway.
        let factor = 1i32 << (attempt - 1).min(30);
        let delay = self.base.checked_mul(factor).unwrap_or(self.cap);
        delay.min(self.cap)
    }

    /// Wall-clock time of the next attempt after failure number `attempt`.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + self.delay_for(attempt)
    }

    /// True once `attempt` failures have consumed the whole budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let minutes: Vec<i64> = (1..=6)
            .map(|attempt| policy.delay_for(attempt).num_minutes())
            .collect();
        assert_eq!(minutes, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn attempt_zero_treated_as_first() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), policy.delay_for(1));
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn next_retry_at_adds_delay() {
        let policy = RetryPolicy::default();
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            policy.next_retry_at(now, 2),
            now + Duration::minutes(10)
        );
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_capped(
            base_secs in 1i64..3600,
            cap_secs in 1i64..86_400,
            attempt in 1u32..64,
        ) {
            let policy = RetryPolicy::new(
                3,
                Duration::seconds(base_secs),
                Duration::seconds(cap_secs),
            );
            let this = policy.delay_for(attempt);
            let next = policy.delay_for(attempt + 1);
            prop_assert!(next >= this);
            prop_assert!(this <= Duration::seconds(cap_secs));
            prop_assert!(this >= Duration::seconds(base_secs.min(cap_secs)));
        }
    }
}
