//! Retry schedule for leased items.
//!
//! Every lease pushes the item's next run time out by `backoff(run_count)`,
//! so an item that keeps failing is retried less and less often.
use std::time::Duration;

/// Default delay after the first lease.
pub const DEFAULT_BASE: Duration = Duration::from_secs(60);

/// Default upper bound for a single delay.
pub const DEFAULT_MAX: Duration = Duration::from_secs(24 * 60 * 60);

/// Doubling backoff: `base`, `2 * base`, `4 * base`, … capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay applied when an item is leased for the `run_count`-th time (1-based).
    pub fn delay(&self, run_count: u32) -> Duration {
        let exponent = run_count.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Same as [`delay`](Self::delay), in milliseconds.
    pub fn delay_ms(&self, run_count: u32) -> u64 {
        u64::try_from(self.delay(run_count).as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}
