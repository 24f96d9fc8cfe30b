//! Session lifecycle: identity, persistence, inactivity watchdog
//!
//! A session is a window of continuous activity. It starts with the first
//! tracked interaction, survives short gaps (recovery from storage), pauses
//! while the surface is hidden, and ends on inactivity, manual stop, or
//! destroy. Transitions are mirrored to peer handles over the broadcast
//! port so every handle of a project shares one live session.

mod manager;

pub use manager::{SessionError, SessionHandle, SessionManager};

use serde::{Deserialize, Serialize};

/// Storage key for the persisted session record
pub const SESSION_STORAGE_KEY: &str = "session";

/// The session record persisted across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    /// Unix millis when the session started
    pub started_at: i64,
    /// Unix millis of the last observed activity
    pub last_activity: i64,
}

/// Mint a session id: `{unix-millis}-{random}`
///
/// The millis prefix makes ids sortable in backend logs; the random suffix
/// disambiguates handles started within the same millisecond.
pub fn generate_session_id() -> String {
    use rand::Rng;
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::rng().random();
    format!("{millis}-{suffix:08x}")
}
