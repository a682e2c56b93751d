//! Retry scheduling for failed Sink deliveries.
//!
//! Transient failures back off exponentially (1s, 2s, 4s, 8s, 16s) until the
//! per-item attempt budget or the absolute retry window runs out, at which
//! point the item transfers to the dead-letter store. Fatal classifications
//! never enter this path; the processor dead-letters them on first sight.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Backoff and budget parameters for one deployment.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed per work item before dead-lettering.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Absolute budget measured from `first_enqueued_at`.
    pub retry_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            retry_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// What to do with a work item after a retriable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { at: DateTime<Utc> },
    DeadLetter { reason: String },
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of failures so far.
    ///
    /// Exponential, base 2, capped: attempts 1..=5 yield 1s, 2s, 4s, 8s, 16s
    /// under the default policy.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        if attempt_count <= 1 {
            return self.base_delay.min(self.max_delay);
        }
        let exponent = attempt_count.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Route a retriable failure: reschedule, or transfer to the dead-letter
    /// store once the attempt budget or the retry window is spent.
    ///
    /// `attempt_count` is the count including the failure being routed.
    pub fn decide(
        &self,
        attempt_count: u32,
        first_enqueued_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::DeadLetter {
                reason: format!("retry budget exhausted after {attempt_count} attempts"),
            };
        }

        let age = now.signed_duration_since(first_enqueued_at);
        let window = chrono::Duration::seconds(self.retry_window.as_secs() as i64);
        if age >= window {
            return RetryDecision::DeadLetter {
                reason: format!(
                    "retry window of {}s elapsed",
                    self.retry_window.as_secs()
                ),
            };
        }

        let delay = self.next_delay(attempt_count);
        RetryDecision::Retry {
            at: now + chrono::Duration::milliseconds(delay.as_millis() as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.next_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_next_delay_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(6).as_secs(), 16);
        assert_eq!(policy.next_delay(40).as_secs(), 16);
    }

    #[test]
    fn test_decide_retries_under_budget() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        match policy.decide(1, now, now) {
            RetryDecision::Retry { at } => {
                assert_eq!((at - now).num_seconds(), 1);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_decide_dead_letters_at_max_attempts() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        assert!(matches!(
            policy.decide(5, now, now),
            RetryDecision::DeadLetter { .. }
        ));
        assert!(matches!(
            policy.decide(6, now, now),
            RetryDecision::DeadLetter { .. }
        ));
    }

    #[test]
    fn test_decide_dead_letters_after_window() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let first = now - chrono::Duration::hours(25);

        assert!(matches!(
            policy.decide(2, first, now),
            RetryDecision::DeadLetter { .. }
        ));
    }

    #[test]
    fn test_decide_window_boundary_still_retries() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let first = now - chrono::Duration::hours(23);

        assert!(matches!(
            policy.decide(2, first, now),
            RetryDecision::Retry { .. }
        ));
    }
}
