//! Delivery engine: transport, retry/backoff, circuit breaking, recovery
//!
//! A batch leaves the event queue once, then fans out to every configured
//! backend independently:
//!
//! ```text
//! batch ──▶ backend A: attempt ── 2xx/3xx ──▶ accepted
//!       ──▶ backend B: attempt ── 4xx ──────▶ permanent, dropped for B
//!       ──▶ backend C: attempt ── 5xx/timeout ─▶ retry (backoff + jitter)
//!                                 └ budget exhausted ─▶ persisted for recovery
//! ```
//!
//! Delivery is at-least-one-backend: per-backend failures never re-queue
//! events another backend already accepted.

mod backoff;
mod circuit;
mod manager;
mod transport;

pub use backoff::{BackoffManager, with_jitter};
pub use circuit::{
    CIRCUIT_RECOVERY_INITIAL, CIRCUIT_RECOVERY_MAX, CIRCUIT_RECOVERY_MULTIPLIER, CircuitBreaker,
    MAX_CONSECUTIVE_FAILURES,
};
pub use manager::{
    BackendFailure, MAX_PERSISTED_BATCHES_PER_BACKEND, PERSISTED_BATCH_KEY_PREFIX, PERSISTED_BATCH_MAX_AGE_MS,
    PersistedBatch, RETRY_INITIAL_DELAY, RETRY_MAX_DELAY, RETRY_MULTIPLIER, SendReport, SenderManager,
};
pub use transport::{HttpTransport, SYNC_FLUSH_TIMEOUT, Transport};

use thiserror::Error;

/// Delivery failure, tagged by retry policy
///
/// Matched explicitly at the sender boundary: permanent failures
/// short-circuit the backend for the batch, transient ones enter the retry
/// schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The backend rejected the batch; retrying cannot help (4xx)
    #[error("permanent delivery failure: HTTP {status}")]
    Permanent { status: u16 },

    /// The attempt failed in a way a retry may fix (5xx, timeout, network)
    #[error("transient delivery failure: {reason}")]
    Transient { reason: String },
}

impl SendError {
    /// Whether this failure must never be retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    /// Build a transient error from a free-form reason
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient { reason: reason.into() }
    }
}

/// Classify an HTTP status code per the delivery contract
///
/// 2xx/3xx succeed, 4xx are permanent, everything else is transient.
pub fn classify_status(status: u16) -> Result<(), SendError> {
    match status {
        200..=399 => Ok(()),
        400..=499 => Err(SendError::Permanent { status }),
        _ => Err(SendError::Transient {
            reason: format!("HTTP {status}"),
        }),
    }
}
