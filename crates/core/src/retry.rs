//! Retry policies: when an item may be attempted again.
//!
//! Two policies with different jobs:
//!
//! - [`RetryInterval`] gates re-processing of a failed credential event. An
//!   event pulled before its interval has elapsed is *skipped*, not failed,
//!   leaving its row untouched for a future run.
//! - [`BackoffPolicy`] governs in-run retries of store writes in the retrigger
//!   pipeline, with exponentially growing delays up to a cap.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum elapsed time since the last attempt before an item is eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInterval {
    pub min_interval: Duration,
}

impl RetryInterval {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// Whether enough time has passed since `last_attempt`.
    ///
    /// Never-attempted items are always eligible; an elapsed time exactly
    /// equal to the interval is eligible.
    pub fn has_elapsed(&self, last_attempt: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_attempt {
            None => true,
            Some(last) => {
                let min = chrono::Duration::from_std(self.min_interval).unwrap_or_default();
                now - last >= min
            }
        }
    }
}

impl Default for RetryInterval {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff for in-run retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Delay cap.
    pub max_delay: Duration,
    /// Maximum number of retries (0 = no retries).
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (initial_ms * self.multiplier.powi((attempt - 1) as i32)).min(max_ms);

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Check if more retries are allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn never_attempted_is_always_eligible() {
        let interval = RetryInterval::new(Duration::from_secs(60));
        assert!(interval.has_elapsed(None, Utc::now()));
    }

    #[test]
    fn recent_attempt_is_not_eligible() {
        let interval = RetryInterval::new(Duration::from_secs(60));
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(30);
        assert!(!interval.has_elapsed(Some(last), now));
    }

    #[test]
    fn elapsed_exactly_at_interval_is_eligible() {
        let interval = RetryInterval::new(Duration::from_secs(60));
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(60);
        assert!(interval.has_elapsed(Some(last), now));
    }

    #[test]
    fn old_attempt_is_eligible() {
        let interval = RetryInterval::new(Duration::from_secs(60));
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(61);
        assert!(interval.has_elapsed(Some(last), now));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_retries: 5,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(500));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(
            BackoffPolicy::default().delay_for_attempt(0),
            Duration::ZERO
        );
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = BackoffPolicy {
            max_retries: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: with a growth factor >= 1, delays never shrink from one
        /// attempt to the next and never exceed the cap.
        #[test]
        fn backoff_is_monotonic_and_capped(
            initial_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            max_ms in 5_000u64..60_000,
            attempt in 1u32..20,
        ) {
            let policy = BackoffPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                multiplier,
                max_delay: Duration::from_millis(max_ms),
                max_retries: 20,
            };

            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(current <= Duration::from_millis(max_ms));
        }

        /// Property: an attempted item is eligible exactly when the elapsed
        /// time has reached the interval.
        #[test]
        fn interval_eligibility_matches_elapsed_time(
            interval_secs in 1i64..3_600,
            elapsed_secs in 0i64..7_200,
        ) {
            let interval = RetryInterval::new(Duration::from_secs(interval_secs as u64));
            let now = Utc::now();
            let last = now - chrono::Duration::seconds(elapsed_secs);

            prop_assert_eq!(
                interval.has_elapsed(Some(last), now),
                elapsed_secs >= interval_secs
            );
        }
    }
}
