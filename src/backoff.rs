//! Exponential connect backoff.
//!
//! Each slot tracks its own consecutive-failure counter. The delay before the
//! k-th reattempt (k counted from 1) is `min(base * 2^(k-1), max)`, so a slot
//! failing repeatedly sleeps `base, 2*base, 4*base, ...` until the cap. A
//! successful connect resets the counter.

use std::time::Duration;

/// Per-slot backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    /// Creates backoff state with the given base delay and cap.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Number of consecutive failed attempts recorded since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True if at least one failure has been recorded since the last reset.
    #[must_use]
    pub fn active(&self) -> bool {
        self.attempts > 0
    }

    /// Records a failed connect attempt and returns the delay to wait before
    /// the next one.
    pub fn next_delay(&mut self) -> Duration {
        // Saturate the shift; 64 doublings exceed any practical cap anyway.
        let factor = 1u64 << self.attempts.min(32);
        let delay = self
            .base
            .checked_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .unwrap_or(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay.min(self.max)
    }

    /// Clears the failure counter after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
