//! Exponential backoff calculator
//!
//! Pure with respect to wall-clock: callers decide when to sleep. Retry
//! loops and circuit breakers hold independent instances so their delay
//! schedules never interfere.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff state for one retry context
#[derive(Debug, Clone)]
pub struct BackoffManager {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl BackoffManager {
    /// Create a calculator starting at `initial`, growing by `multiplier`
    /// per step, capped at `max`
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// Return the delay to use now, then advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Attempts consumed since creation or the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Restore the initial delay and zero attempts
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

/// Apply a ±50% jitter window to a delay
///
/// Spreads retry bursts from concurrent handles so backends do not see
/// synchronized waves.
pub fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
