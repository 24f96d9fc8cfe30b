//! Cross-handle session synchronization
//!
//! Multiple tracker handles for the same project (one per surface in a
//! host application) must agree on the live session. Handles publish
//! session transitions on a broadcast port; peers adopt announced sessions
//! instead of minting their own, and end theirs when a peer ends the shared
//! one.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast channel depth per project
const BROADCAST_CAPACITY: usize = 32;

/// A session transition announced to peer handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Handle that produced the message; receivers ignore their own
    pub origin: String,
    pub kind: SessionMessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessageKind {
    /// A new session started; peers adopt this id
    Started { session_id: String },
    /// The shared session ended; peers clear their session state
    Ended { session_id: String },
    /// Activity was observed; peers reset their inactivity deadline
    Activity,
}

/// Port for session sync between handles of the same project
pub trait SessionBroadcast: Send + Sync {
    /// Publish a transition to peers; best-effort
    fn publish(&self, message: SessionMessage);

    /// Subscribe to peer transitions
    fn subscribe(&self) -> broadcast::Receiver<SessionMessage>;
}

/// Process-wide broadcast registry, one channel per project id
///
/// Handles created with the same project id share a channel regardless of
/// where in the process they live. Senders are never removed; a project's
/// channel lives for the process, which is bounded by the number of
/// distinct project ids.
static REGISTRY: OnceLock<Mutex<HashMap<String, broadcast::Sender<SessionMessage>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, broadcast::Sender<SessionMessage>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Broadcast port backed by the process-wide registry
pub struct ChannelBroadcast {
    tx: broadcast::Sender<SessionMessage>,
}

impl ChannelBroadcast {
    /// Join (or create) the channel for a project
    pub fn join(project_id: &str) -> Self {
        let mut channels = registry().lock().unwrap_or_else(PoisonError::into_inner);
        let tx = channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone();
        debug!(project_id, "ChannelBroadcast::join");
        Self { tx }
    }
}

impl SessionBroadcast for ChannelBroadcast {
    fn publish(&self, message: SessionMessage) {
        // No receivers is fine: a lone handle publishes into the void.
        let _ = self.tx.send(message);
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionMessage> {
        self.tx.subscribe()
    }
}

/// Disconnected port for isolated handles (tests, single-surface hosts)
pub struct NoopBroadcast {
    tx: broadcast::Sender<SessionMessage>,
}

impl Default for NoopBroadcast {
    fn default() -> Self {
        Self {
            tx: broadcast::channel(1).0,
        }
    }
}

impl SessionBroadcast for NoopBroadcast {
    fn publish(&self, _message: SessionMessage) {}

    fn subscribe(&self) -> broadcast::Receiver<SessionMessage> {
        self.tx.subscribe()
    }
}
