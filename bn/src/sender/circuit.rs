//! Per-backend circuit breaker
//!
//! After a run of consecutive transient failures a backend's circuit opens
//! and delivery attempts are suppressed until the recovery delay elapses.
//! Each backend owns an independent breaker with its own BackoffManager, so
//! one flaky backend never throttles the others.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::backoff::BackoffManager;

/// Consecutive transient failures that open the circuit
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Initial circuit recovery delay
pub const CIRCUIT_RECOVERY_INITIAL: Duration = Duration::from_secs(5);

/// Recovery delay growth per re-opened circuit
pub const CIRCUIT_RECOVERY_MULTIPLIER: f64 = 2.0;

/// Cap on the circuit recovery delay
pub const CIRCUIT_RECOVERY_MAX: Duration = Duration::from_secs(120);

/// Breaker state for one backend
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
    recovery: BackoffManager,
    open_until: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            MAX_CONSECUTIVE_FAILURES,
            BackoffManager::new(CIRCUIT_RECOVERY_INITIAL, CIRCUIT_RECOVERY_MULTIPLIER, CIRCUIT_RECOVERY_MAX),
        )
    }
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures
    pub fn new(threshold: u32, recovery: BackoffManager) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
            recovery,
            open_until: None,
        }
    }

    /// Whether attempts are currently suppressed
    ///
    /// Once the recovery deadline passes the next attempt is allowed through
    /// (half-open); its outcome decides whether the circuit closes or
    /// re-opens with a longer delay.
    pub fn is_open(&self, now: Instant) -> bool {
        self.open_until.is_some_and(|until| now < until)
    }

    /// Record a transient failure; may open the circuit
    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            let delay = self.recovery.next_delay();
            self.open_until = Some(now + delay);
            warn!(?delay, failures = self.consecutive_failures, "circuit opened");
        }
    }

    /// Record a successful delivery; closes the circuit and resets recovery
    pub fn record_success(&mut self) {
        if self.open_until.is_some() || self.consecutive_failures > 0 {
            debug!("circuit closed");
        }
        self.consecutive_failures = 0;
        self.open_until = None;
        self.recovery.reset();
    }
}
