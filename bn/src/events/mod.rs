//! Event pipeline: types, observability bus, and the tracking queue
//!
//! Every tracked interaction flows through [`EventManager::track`]:
//!
//! ```text
//! host adapters ──▶ track(payload)
//!                     │  no session?  ──▶ pending buffer (kept, retried)
//!                     │  sampled out? ──▶ discarded silently
//!                     ▼
//!             enrich from State ──▶ bounded FIFO queue ──▶ SenderManager
//!                     │                      (oldest evicted on overflow)
//!                     └──▶ EventBus (host `on("event")` subscribers)
//! ```
//!
//! Batching is threshold-or-timer: the queue flushes immediately at
//! [`BATCH_SIZE_THRESHOLD`] and otherwise waits for the periodic flush.

mod bus;
mod manager;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use manager::{EventError, EventManager, TrackOutcome};
pub use types::{
    BATCH_SIZE_THRESHOLD, Event, EventPayload, MAX_EVENTS_QUEUE_LENGTH, MAX_METADATA_ENTRIES,
    MAX_METADATA_STRING_LENGTH, MAX_PENDING_BUFFER_LENGTH, MetadataError, ScrollDirection,
    SessionEndReason, WebVitalMetric, WirePayload, sanitize_metadata, validate_metadata,
};
