//! Bounded retry policy with exponential backoff and symmetric jitter.
//!
//! This module only computes delays. The async loop that sleeps and applies
//! per-attempt timeouts belongs to its caller (the summarizer coordinator in
//! `mnemo-context`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default total attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default delay ceiling in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
/// Default jitter factor, as a fraction of the delay.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// How often to retry a failing operation, and how long to wait in between.
///
/// Missing fields in a settings file fall back to the defaults above.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failure, in ms. Doubles on each further failure.
    pub base_delay_ms: u64,
    /// Upper bound on the un-jittered delay, in ms.
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay, clamped to `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Attempt count, never below one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sleep before retrying after failed attempt `attempt` (zero-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt, rand::random()))
    }

    /// `min(max_delay, base · 2^attempt) · (1 + (2r − 1) · jitter)`, rounded.
    ///
    /// `random` is expected in `[0, 1)`; `0.5` yields the un-jittered delay.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn backoff_ms(&self, attempt: u32, random: f64) -> u64 {
        let doubled = self.base_delay_ms.saturating_mul(1u64 << attempt.min(31));
        let capped = doubled.min(self.max_delay_ms) as f64;
        let spread = (random * 2.0 - 1.0) * self.jitter_factor.clamp(0.0, 1.0);
        (capped * (1.0 + spread)).round().max(0.0) as u64
    }
}
