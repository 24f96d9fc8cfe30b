//! EventManager - the tracking queue
//!
//! Owns the bounded outgoing queue and the pre-session pending buffer.
//! `track` applies the session guard, consent hold, sampling, URL exclusion,
//! and enrichment; the pipeline task drains batches into the sender.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::QaToggle;
use crate::consent::{ConsentCategory, ConsentHandle};
use crate::state::{StateError, StateHandle, StateUpdate};

use super::bus::EventBus;
use super::types::{
    BATCH_SIZE_THRESHOLD, Event, EventPayload, MAX_EVENTS_QUEUE_LENGTH, MAX_PENDING_BUFFER_LENGTH,
    MetadataError, sanitize_metadata, validate_metadata,
};

/// Errors surfaced by tracking calls
#[derive(Debug, Error)]
pub enum EventError {
    /// Metadata failed strict validation (QA mode only)
    #[error("invalid event metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),

    /// The state actor is gone (SDK destroyed mid-call)
    #[error(transparent)]
    State(#[from] StateError),
}

/// What `track` did with the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Enriched and appended to the queue
    Queued {
        /// Whether this event pushed the queue over the batch threshold
        flush_triggered: bool,
    },
    /// Parked in the pending buffer (no session yet, or consent revoked)
    Buffered,
    /// Discarded by the sampling draw
    SampledOut,
    /// Discarded because the page URL matches an exclusion pattern
    Excluded,
    /// Discarded: restored scroll position after navigation, not a user scroll
    ScrollSuppressed,
}

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<Event>,
    pending: VecDeque<EventPayload>,
    overflow_dropped: u64,
    sampled_out: u64,
}

/// The event queue; cheap to clone, clones share all state
#[derive(Clone)]
pub struct EventManager {
    state: StateHandle,
    bus: Arc<EventBus>,
    consent: ConsentHandle,
    qa: QaToggle,
    inner: Arc<Mutex<QueueInner>>,
    flush_notify: Arc<Notify>,
}

impl EventManager {
    /// Create a queue wired to the given state, bus, and consent handles
    pub fn new(state: StateHandle, bus: Arc<EventBus>, consent: ConsentHandle, qa: QaToggle) -> Self {
        Self {
            state,
            bus,
            consent,
            qa,
            inner: Arc::new(Mutex::new(QueueInner::default())),
            flush_notify: Arc::new(Notify::new()),
        }
    }

    /// Signal handle the pipeline task awaits for threshold flushes
    pub fn flush_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.flush_notify)
    }

    /// Track one event through the full policy chain
    ///
    /// Never drops silently except where policy says so (sampling, URL
    /// exclusion); an event that cannot be queued yet is buffered. The only
    /// error path is strict metadata validation in QA mode.
    pub async fn track(&self, payload: EventPayload) -> Result<TrackOutcome, EventError> {
        let payload = self.apply_metadata_policy(payload)?;
        let snapshot = self.state.get().await?;

        if matches!(payload, EventPayload::Scroll { .. }) && snapshot.suppress_next_scroll {
            self.state.set(StateUpdate::SuppressNextScroll(false)).await?;
            debug!("track: suppressing restored scroll");
            return Ok(TrackOutcome::ScrollSuppressed);
        }

        if !payload.is_lifecycle() {
            if let (Some(config), Some(url)) = (&snapshot.config, &snapshot.page_url) {
                if config.is_url_excluded(url) {
                    debug!(%url, "track: page URL excluded");
                    return Ok(TrackOutcome::Excluded);
                }
            }
        }

        let consent_ok = payload.is_lifecycle() || self.consent.is_granted(ConsentCategory::Analytics);
        let Some(session_id) = snapshot.session_id.clone().filter(|_| consent_ok) else {
            self.buffer_pending(payload);
            return Ok(TrackOutcome::Buffered);
        };

        let sampling_rate = snapshot.config.as_ref().map(|c| c.sampling_rate).unwrap_or(1.0);
        if !payload.is_lifecycle() && rand::rng().random::<f64>() >= sampling_rate {
            self.locked(|inner| inner.sampled_out += 1);
            return Ok(TrackOutcome::SampledOut);
        }

        let event = Event {
            payload,
            timestamp: Utc::now().timestamp_millis(),
            page_url: snapshot.page_url.clone().unwrap_or_default(),
            session_id,
            user_id: snapshot.user_id.clone(),
            device: snapshot.device.clone(),
        };

        let flush_triggered = self.locked(|inner| {
            inner.queue.push_back(event.clone());
            while inner.queue.len() > MAX_EVENTS_QUEUE_LENGTH {
                inner.queue.pop_front();
                inner.overflow_dropped += 1;
            }
            inner.queue.len() >= BATCH_SIZE_THRESHOLD
        });

        if self.qa.enabled() {
            tracing::info!(event = %serde_json::to_string(&event).unwrap_or_default(), "qa: event tracked");
        }
        self.bus.emit(event);

        if flush_triggered {
            self.flush_notify.notify_one();
        }
        Ok(TrackOutcome::Queued { flush_triggered })
    }

    /// Re-track everything in the pending buffer, in original order
    ///
    /// No-op while the session is still absent or consent is still revoked;
    /// buffered events are never discarded for lack of a session. Returns the
    /// number of events re-tracked.
    pub async fn flush_pending_events(&self) -> Result<usize, EventError> {
        let snapshot = self.state.get().await?;
        if snapshot.session_id.is_none() || !self.consent.is_granted(ConsentCategory::Analytics) {
            return Ok(0);
        }

        let drained: Vec<EventPayload> = self.locked(|inner| inner.pending.drain(..).collect());
        let count = drained.len();
        if count > 0 {
            debug!(count, "flush_pending_events: replaying buffered events");
        }
        for payload in drained {
            self.track(payload).await?;
        }
        Ok(count)
    }

    /// Remove and return every queued event, preserving order
    pub fn drain_batch(&self) -> Vec<Event> {
        self.locked(|inner| inner.queue.drain(..).collect())
    }

    /// Current queue length
    pub fn queue_length(&self) -> usize {
        self.locked(|inner| inner.queue.len())
    }

    /// Current pending-buffer length
    pub fn pending_length(&self) -> usize {
        self.locked(|inner| inner.pending.len())
    }

    /// Events evicted by the queue bound since init
    pub fn overflow_dropped(&self) -> u64 {
        self.locked(|inner| inner.overflow_dropped)
    }

    fn apply_metadata_policy(&self, mut payload: EventPayload) -> Result<EventPayload, EventError> {
        if let EventPayload::Custom { metadata, name } = &mut payload {
            if self.qa.enabled() {
                validate_metadata(metadata)?;
            } else {
                let (kept, dropped) = sanitize_metadata(std::mem::take(metadata));
                if !dropped.is_empty() {
                    warn!(event = %name, ?dropped, "invalid metadata fields stripped");
                }
                *metadata = kept;
            }
        }
        Ok(payload)
    }

    fn buffer_pending(&self, payload: EventPayload) {
        self.locked(|inner| {
            inner.pending.push_back(payload);
            // A session that never materializes must not grow the buffer
            // without bound.
            while inner.pending.len() > MAX_PENDING_BUFFER_LENGTH {
                inner.pending.pop_front();
                warn!("pending buffer over cap, oldest buffered event dropped");
            }
        });
    }

    fn locked<T>(&self, f: impl FnOnce(&mut QueueInner) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
