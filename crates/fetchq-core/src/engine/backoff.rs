//! Exponential backoff between transfer attempts

use fetchq_types::Settings;
use std::time::Duration;

/// Doubling delay, starting at `base` and never exceeding `cap`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.retry_base_delay(), settings.retry_max_delay())
    }

    /// Delay to wait after the `failures`-th failure
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }
}
