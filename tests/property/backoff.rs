//! Backoff schedule bounds

use copyline::error::StageError;
use copyline::recovery::BackoffPolicy;
use proptest::prelude::*;
use std::time::Duration;

/// Base delays double per attempt and never exceed the cap
#[test]
fn test_base_delay_is_monotone_and_capped() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(1u64..5_000, 1u64..120_000, 0u32..40),
            |(initial_ms, max_ms, attempt)| {
                let policy =
                    BackoffPolicy::new(Duration::from_millis(initial_ms), Duration::from_millis(max_ms));
                let current = policy.base_delay(attempt);
                let next = policy.base_delay(attempt + 1);

                prop_assert!(current <= Duration::from_millis(max_ms));
                prop_assert!(next >= current);
                if attempt < 20 {
                    let expected = Duration::from_millis(initial_ms << attempt);
                    prop_assert_eq!(current, expected.min(Duration::from_millis(max_ms)));
                }
                Ok(())
            },
        )
        .unwrap();
}

/// Jitter stays within `[base, base * (1 + ratio)]`
#[test]
fn test_jitter_bounds() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(1u64..2_000, 0u32..8, 0.0f64..=1.0),
            |(initial_ms, attempt, ratio)| {
                let policy = BackoffPolicy::new(
                    Duration::from_millis(initial_ms),
                    Duration::from_secs(60),
                )
                .with_jitter_ratio(ratio);
                let base = policy.base_delay(attempt);
                let delay = policy.delay(attempt);

                prop_assert!(delay >= base);
                // One microsecond of slack for float rounding.
                prop_assert!(delay <= base.mul_f64(1.0 + ratio) + Duration::from_micros(1));
                Ok(())
            },
        )
        .unwrap();
}

/// A retry-after hint replaces the computed schedule
#[test]
fn test_retry_after_wins() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(0u32..10, 1u64..600_000), |(attempt, retry_after_ms)| {
            let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
            let err = StageError::rate_limited(
                "Too many requests",
                Some(Duration::from_millis(retry_after_ms)),
            );
            prop_assert_eq!(
                policy.delay_for(attempt, &err),
                Duration::from_millis(retry_after_ms)
            );
            Ok(())
        })
        .unwrap();
}
