//! # Retry delay calculation.
//!
//! The delay for retry `n` (0-indexed) is `min(base × 2^n, max)` plus a jitter
//! drawn uniformly from `[0, 0.25 × delay)`. The jitter is added *after* the cap,
//! so the realized delay may exceed `max` by up to 25%. Setting
//! [`BackoffPolicy::clamp_jitter`] clamps the jittered value back to `max`.
//!
//! ```rust
//! use std::time::Duration;
//! use vigil_core::backoff::BackoffPolicy;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_millis(300_000));
//! assert_eq!(policy.capped(0), Duration::from_millis(1000));
//! assert_eq!(policy.capped(8), Duration::from_millis(256_000));
//! assert_eq!(policy.capped(10), Duration::from_millis(300_000));
//! ```

use rand::Rng;
use std::time::Duration;

/// Jitter ceiling as a fraction of the capped delay.
pub const JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap applied to the exponential term.
    pub max: Duration,
    /// Clamp the final (jittered) delay to `max` as well.
    pub clamp_jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(300_000))
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            clamp_jitter: false,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// `min(base × 2^attempt, max)` with saturating arithmetic.
    pub fn capped(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Exclusive upper bound of the jitter added for `attempt`.
    pub fn jitter_ceiling(&self, attempt: u32) -> Duration {
        let capped_ms = self.capped(attempt).as_millis() as f64;
        Duration::from_millis((capped_ms * JITTER_FRACTION) as u64)
    }

    /// Delay for `attempt` using the thread-local RNG.
    pub fn next(&self, attempt: u32) -> Duration {
        self.next_with(attempt, &mut rand::thread_rng())
    }

    /// Delay for `attempt` using the supplied RNG.
    pub fn next_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped(attempt);
        let ceiling_ms = self.jitter_ceiling(attempt).as_millis() as u64;
        let jitter_ms = if ceiling_ms == 0 {
            0
        } else {
            rng.gen_range(0..ceiling_ms)
        };
        let delay = capped + Duration::from_millis(jitter_ms);
        if self.clamp_jitter {
            delay.min(self.max)
        } else {
            delay
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
