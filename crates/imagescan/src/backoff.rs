//! Exponential retry backoff for failed image scans

use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_BACKOFF_DURATION: Duration = Duration::from_secs(60);

/// Default growth factor between retries
pub const DEFAULT_BACKOFF_FACTOR: u32 = 3;

/// Default number of growth steps before the delay stops increasing
pub const DEFAULT_BACKOFF_STEPS: u32 = 8;

/// Exponential backoff state.
///
/// Each `step` returns the current delay and multiplies it by `factor`
/// while `steps` remain. Once the steps are used up the delay is frozen and
/// returned on every further call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBackoff {
    duration: Duration,
    factor: u32,
    steps: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKOFF_DURATION,
            DEFAULT_BACKOFF_FACTOR,
            DEFAULT_BACKOFF_STEPS,
        )
    }
}

impl RetryBackoff {
    pub fn new(duration: Duration, factor: u32, steps: u32) -> Self {
        Self {
            duration,
            factor,
            steps,
        }
    }

    /// Advance the backoff and return the delay until the next attempt
    pub fn step(&mut self) -> Duration {
        if self.steps == 0 {
            return self.duration;
        }
        self.steps -= 1;

        let current = self.duration;
        self.duration = current.saturating_mul(self.factor);
        current
    }

    /// Remaining growth steps
    pub fn remaining_steps(&self) -> u32 {
        self.steps
    }
}
