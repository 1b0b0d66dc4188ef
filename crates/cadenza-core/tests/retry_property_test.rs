//! Property-based tests for the shared retry policy.
//!
//! The policy is a pure function, so its bounds can be checked exhaustively
//! over generated attempt counts and configurations without any storage.

use std::time::Duration;

use cadenza_core::retry::{BackoffStrategy, FailureKind, RetryDecision, RetryPolicy};
use proptest::prelude::*;

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (
        1u32..=10,      // max_attempts
        1u64..=600,     // base_delay seconds
        600u64..=86400, // max_delay seconds
        prop_oneof![
            Just(BackoffStrategy::Exponential),
            Just(BackoffStrategy::Linear),
            Just(BackoffStrategy::Fixed),
        ],
    )
        .prop_map(|(max_attempts, base, max, backoff_strategy)| RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max),
            jitter_factor: 0.0,
            backoff_strategy,
        })
}

proptest! {
    /// The number of retries granted never exceeds `max_attempts - 1`.
    #[test]
    fn retries_are_bounded_by_max_attempts(policy in policy_strategy()) {
        let granted = (1..=policy.max_attempts + 5)
            .take_while(|&failures| {
                matches!(
                    policy.next_delay(failures, FailureKind::Retryable),
                    RetryDecision::Retry { .. }
                )
            })
            .count();

        prop_assert_eq!(granted as u32, policy.max_attempts - 1);
    }

    /// Permanent failures never retry, whatever the attempt count.
    #[test]
    fn permanent_failures_always_give_up(policy in policy_strategy(), failures in 1u32..20) {
        let decision = policy.next_delay(failures, FailureKind::Permanent);
        prop_assert!(matches!(decision, RetryDecision::GiveUp { .. }), "expected GiveUp");
    }

    /// Every granted delay respects the ceiling.
    #[test]
    fn delays_never_exceed_max_delay(policy in policy_strategy(), failures in 1u32..10) {
        let decision = policy.next_delay(failures, FailureKind::Retryable);
        if let RetryDecision::Retry { delay } = decision {
            prop_assert!(delay <= policy.max_delay);
        }
    }

    /// Exponential delays are non-decreasing across a series.
    #[test]
    fn exponential_delays_are_monotonic(base in 1u64..=300, max_attempts in 2u32..=10) {
        let policy = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(base),
            ..RetryPolicy::delivery()
        };

        let delays: Vec<Duration> = (1..max_attempts)
            .filter_map(|failures| match policy.next_delay(failures, FailureKind::Retryable) {
                RetryDecision::Retry { delay } => Some(delay),
                RetryDecision::GiveUp { .. } => None,
            })
            .collect();

        prop_assert_eq!(delays.first().copied(), Some(Duration::from_secs(base)));
        prop_assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    /// Rate-limit hints replace the computed backoff but still respect the cap.
    #[test]
    fn rate_limit_hint_is_capped(policy in policy_strategy(), hint in 0u64..200_000) {
        if policy.max_attempts < 2 {
            return Ok(());
        }
        let kind = FailureKind::RateLimited { retry_after: Duration::from_secs(hint) };
        let decision = policy.next_delay(1, kind);
        prop_assert_eq!(
            decision,
            RetryDecision::Retry { delay: Duration::from_secs(hint).min(policy.max_delay) }
        );
    }
}
