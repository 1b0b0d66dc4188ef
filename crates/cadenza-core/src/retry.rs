//! Retry policy shared by partner delivery and webhook dispatch.
//!
//! The policy is a pure function from (failures so far, failure kind) to a
//! decision. It owns no timers and performs no I/O: callers persist the
//! resulting `next_retry_at` and a periodic sweep picks the row up again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Base delay for partner delivery retries.
pub const DELIVERY_BASE_DELAY: Duration = Duration::from_secs(60);

/// Base delay for webhook retries when the endpoint does not override it.
pub const WEBHOOK_BASE_DELAY: Duration = Duration::from_secs(60);

/// Classification of a failed call, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, connection failure or 5xx-equivalent.
    Retryable,

    /// The remote side asked to be left alone for `retry_after`.
    RateLimited {
        /// Delay requested by the remote side.
        retry_after: Duration,
    },

    /// Validation rejection or other 4xx-equivalent; retrying cannot help.
    Permanent,
}

impl FailureKind {
    /// Returns whether a failure of this kind may be retried.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Delay doubles after every failure.
    Exponential,
    /// Delay grows by the base amount after every failure.
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts in a series, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0). Zero keeps delays deterministic.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::delivery()
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// Time to wait before the next attempt
        delay: Duration,
    },
    /// Stop retrying.
    GiveUp {
        /// Reason why the series should not be retried
        reason: String,
    },
}

impl RetryDecision {
    /// Returns the absolute time of the next attempt, if any.
    pub fn next_attempt_at(&self, failed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { delay } => {
                chrono::Duration::from_std(*delay).ok().map(|delay| failed_at + delay)
            },
            Self::GiveUp { .. } => None,
        }
    }
}

impl RetryPolicy {
    /// Policy for partner deliveries: 3 attempts, 60s doubling backoff.
    pub fn delivery() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DELIVERY_BASE_DELAY,
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Policy for a webhook endpoint with the given attempt cap and base delay.
    pub fn webhook(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(6 * 3600),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Returns a copy with a different attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Decides what happens after the `failures`-th failed attempt.
    ///
    /// `failures` counts failures in the current series including this one,
    /// so the first failure is `1`. The delay before retry `n` is
    /// `base * 2^(n-1)` under exponential backoff: the first retry waits
    /// exactly `base`.
    pub fn next_delay(&self, failures: u32, kind: FailureKind) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::GiveUp { reason: "non-retryable failure".to_string() };
        }

        if failures >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = match kind {
            FailureKind::RateLimited { retry_after } => retry_after.min(self.max_delay),
            _ => self.backoff(failures),
        };

        RetryDecision::Retry { delay }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);

        let raw = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(failures.max(1)),
            BackoffStrategy::Exponential => {
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent.min(20)))
            },
        };

        let capped = raw.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes `duration` by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_policy_follows_documented_table() {
        let policy = RetryPolicy::delivery();
        let table = [
            (1, FailureKind::Retryable, Some(60)),
            (2, FailureKind::Retryable, Some(120)),
            (3, FailureKind::Retryable, None),
            (1, FailureKind::Permanent, None),
            (2, FailureKind::Permanent, None),
        ];

        for (failures, kind, expected) in table {
            let decision = policy.next_delay(failures, kind);
            match expected {
                Some(secs) => {
                    assert_eq!(
                        decision,
                        RetryDecision::Retry { delay: Duration::from_secs(secs) },
                        "failures={failures} kind={kind:?}"
                    );
                },
                None => assert!(
                    matches!(decision, RetryDecision::GiveUp { .. }),
                    "failures={failures} kind={kind:?} should give up"
                ),
            }
        }
    }

    #[test]
    fn permanent_failures_give_up_on_first_attempt() {
        let policy = RetryPolicy::webhook(10, Duration::from_secs(5));
        match policy.next_delay(1, FailureKind::Permanent) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("permanent failures never retry"),
        }
    }

    #[test]
    fn webhook_policy_uses_endpoint_base_delay() {
        let policy = RetryPolicy::webhook(5, Duration::from_secs(10));
        let delays: Vec<_> = (1..5)
            .map(|failures| match policy.next_delay(failures, FailureKind::Retryable) {
                RetryDecision::Retry { delay } => delay.as_secs(),
                RetryDecision::GiveUp { reason } => unreachable!("gave up early: {reason}"),
            })
            .collect();

        assert_eq!(delays, vec![10, 20, 40, 80]);
    }

    #[test]
    fn rate_limit_hint_overrides_backoff() {
        let policy = RetryPolicy::delivery();
        let decision = policy.next_delay(
            1,
            FailureKind::RateLimited { retry_after: Duration::from_secs(900) },
        );
        assert_eq!(decision, RetryDecision::Retry { delay: Duration::from_secs(900) });
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 40,
            max_delay: Duration::from_secs(300),
            ..RetryPolicy::delivery()
        };

        assert_eq!(
            policy.next_delay(30, FailureKind::Retryable),
            RetryDecision::Retry { delay: Duration::from_secs(300) }
        );
    }

    #[test]
    fn fixed_and_linear_strategies() {
        let fixed = RetryPolicy {
            max_attempts: 5,
            backoff_strategy: BackoffStrategy::Fixed,
            ..RetryPolicy::delivery()
        };
        let linear = RetryPolicy { backoff_strategy: BackoffStrategy::Linear, ..fixed.clone() };

        assert_eq!(
            fixed.next_delay(3, FailureKind::Retryable),
            RetryDecision::Retry { delay: Duration::from_secs(60) }
        );
        assert_eq!(
            linear.next_delay(3, FailureKind::Retryable),
            RetryDecision::Retry { delay: Duration::from_secs(180) }
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.25, ..RetryPolicy::delivery() };

        for _ in 0..100 {
            let RetryDecision::Retry { delay } = policy.next_delay(1, FailureKind::Retryable)
            else {
                unreachable!("first failure retries");
            };
            assert!(delay >= Duration::from_secs(45) && delay <= Duration::from_secs(75));
        }
    }

    #[test]
    fn next_attempt_at_offsets_failure_time() {
        let failed_at = Utc::now();
        let decision = RetryDecision::Retry { delay: Duration::from_secs(60) };
        assert_eq!(
            decision.next_attempt_at(failed_at),
            Some(failed_at + chrono::Duration::seconds(60))
        );
        let give_up = RetryDecision::GiveUp { reason: String::new() };
        assert_eq!(give_up.next_attempt_at(failed_at), None);
    }
}
