//! Retry policy for per-neighbor delivery.
//!
//! Propagation retries a failed delivery with **linear** backoff: after the
//! `i`-th failed attempt the retry loop sleeps `i × backoff_unit`. Every attempt
//! runs under its own timeout, so a hung peer costs at most `attempt_timeout`
//! per attempt.
//!
//! # Backoff Schedule (defaults)
//!
//! ```text
//! Attempt  Timeout  Wait after failure  Cumulative wait
//! -------  -------  ------------------  ---------------
//! 1        1s       1s                  1s
//! 2        1s       2s                  3s
//! 3        1s       3s                  6s
//! ...
//! 100      1s       (gives up)          ~82m
//! ```
//!
//! Exhausting the budget is not escalated: the original caller was
//! acknowledged long ago and anti-entropy re-derives the value anyway.

use std::time::Duration;

/// Bounded retry with linearly increasing backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Timeout for each individual attempt.
    pub attempt_timeout: Duration,

    /// Attempt `i` (1-indexed) waits `i` of these before attempt `i + 1`.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            attempt_timeout: Duration::from_secs(1),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Fast-fail policy for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_millis(100),
            backoff_unit: Duration::from_millis(5),
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sum of all backoff waits if every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts).fold(Duration::ZERO, |acc, attempt| {
            acc.saturating_add(self.delay_after_attempt(attempt))
        })
    }
}
