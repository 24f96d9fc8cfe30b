//! Beacon - embedded analytics event tracking
//!
//! Beacon is a client-side tracking SDK: host applications hand it user
//! interactions and it takes care of sessions, batching, delivery, and
//! persistence. Delivery failures never surface to the host; events are
//! retried, persisted, or (when policy says so) deliberately dropped.
//!
//! # Core Concepts
//!
//! - **Never lose an event silently**: no session yet means buffered, not
//!   dropped; transient delivery failure means retried, then persisted
//! - **Sessions are shared**: handles of one project agree on the live
//!   session over a broadcast port
//! - **Failures are data**: the sender reports per-backend outcomes instead
//!   of returning errors to tracking calls
//!
//! # Modules
//!
//! - [`tracker`] - The public facade (`init`, `track`, `destroy`)
//! - [`events`] - Event types, the observability bus, and the tracking queue
//! - [`session`] - Session identity, recovery, and the inactivity watchdog
//! - [`sender`] - Delivery: transport, retry, circuit breaking, recovery
//! - [`state`] - The shared state actor
//! - [`config`] - Configuration loading, remote overlay, normalization
//! - [`consent`] - Consent categories and the opt-out model
//! - [`broadcast`] - Cross-handle session synchronization
//! - [`cli`] - Command-line interface

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod consent;
pub mod events;
pub mod sender;
pub mod session;
pub mod state;
pub mod tracker;

// Re-export commonly used types
pub use broadcast::{ChannelBroadcast, NoopBroadcast, SessionBroadcast, SessionMessage, SessionMessageKind};
pub use config::{AppConfig, Config, ConfigManager, ConfigWarning, Mode, QaToggle, normalize};
pub use consent::{ConsentCategory, ConsentHandle, ConsentState};
pub use events::{
    Event, EventBus, EventError, EventManager, EventPayload, ScrollDirection, SessionEndReason, TrackOutcome,
    WebVitalMetric, WirePayload,
};
pub use sender::{
    BackoffManager, CircuitBreaker, HttpTransport, SendError, SendReport, SenderManager, Transport,
};
pub use session::{SessionError, SessionHandle, SessionManager, StoredSession, generate_session_id};
pub use state::{State, StateError, StateHandle, StateManager, StateUpdate};
pub use tracker::{Tracker, TrackerError};
