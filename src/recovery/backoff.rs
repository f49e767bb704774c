//! Exponential backoff with bounded random jitter.

use rand::Rng;
use std::time::Duration;

use crate::error::StageError;

/// Delay schedule shared by batch recovery and [`with_retry`](super::with_retry).
///
/// `delay(n) = min(initial * 2^n, max)`, plus uniform jitter in `[0, jitter_ratio * delay]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            jitter_ratio: 0.3,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Deterministic part of the delay for `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Base delay plus random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        // The field is public, so it may hold anything.
        let bound = base.as_secs_f64() * self.jitter_ratio.clamp(0.0, 1.0);
        if !bound.is_finite() || bound <= 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=bound);
        base + Duration::from_secs_f64(jitter)
    }

    /// Delay before retrying after `error`. A caller-supplied retry-after wins over the
    /// computed schedule.
    pub fn delay_for(&self, attempt: u32, error: &StageError) -> Duration {
        match error.retry_after() {
            Some(retry_after) => retry_after,
            None => self.delay(attempt),
        }
    }
}
