//! SessionManager - actor owning the session lifecycle
//!
//! One watchdog task per tracker handle. Commands arrive on an mpsc
//! channel, peer transitions on the broadcast port, and the inactivity
//! deadline is a timer armed only while the surface is visible.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use beaconstore::Store;

use crate::broadcast::{SessionBroadcast, SessionMessage, SessionMessageKind};
use crate::events::{EventError, EventManager, EventPayload, SessionEndReason};
use crate::state::{StateError, StateHandle, StateUpdate};

use super::{SESSION_STORAGE_KEY, StoredSession, generate_session_id};

const CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced by session commands
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session actor is gone
    #[error("session channel closed")]
    ChannelError,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Event(#[from] EventError),
}

enum SessionCommand {
    Start {
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    Touch,
    Visibility {
        visible: bool,
    },
    Stop {
        reason: SessionEndReason,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// The session actor
pub struct SessionManager {
    rx: mpsc::Receiver<SessionCommand>,
    peer_rx: broadcast::Receiver<SessionMessage>,
    handle_id: String,
    store: Store,
    state: StateHandle,
    events: EventManager,
    port: Arc<dyn SessionBroadcast>,
    timeout: std::time::Duration,
    current: Option<StoredSession>,
    deadline: Option<Instant>,
    visible: bool,
}

impl SessionManager {
    /// Spawn the watchdog and return a handle to it
    pub fn spawn(
        store: Store,
        state: StateHandle,
        events: EventManager,
        port: Arc<dyn SessionBroadcast>,
        timeout: std::time::Duration,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let peer_rx = port.subscribe();
        let manager = Self {
            rx,
            peer_rx,
            handle_id: uuid::Uuid::now_v7().to_string(),
            store,
            state,
            events,
            port,
            timeout,
            current: None,
            deadline: None,
            visible: true,
        };
        tokio::spawn(manager.run());
        SessionHandle { tx }
    }

    async fn run(mut self) {
        debug!(handle_id = %self.handle_id, "SessionManager::run: watchdog started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Ok(message) = self.peer_rx.recv() => {
                    self.handle_peer(message).await;
                }
                _ = until(self.deadline) => {
                    debug!("SessionManager::run: inactivity deadline reached");
                    self.end_session(SessionEndReason::Inactivity).await;
                }
            }
        }
        debug!(handle_id = %self.handle_id, "SessionManager::run: watchdog stopped");
    }

    /// Returns true when the actor should stop
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Start { reply } => {
                let _ = reply.send(self.start_session().await);
            }
            SessionCommand::Touch => self.touch(),
            SessionCommand::Visibility { visible } => self.set_visibility(visible),
            SessionCommand::Stop { reason, reply } => {
                self.end_session(reason).await;
                let _ = reply.send(());
            }
            SessionCommand::Shutdown => return true,
        }
        false
    }

    async fn start_session(&mut self) -> Result<String, SessionError> {
        if let Some(current) = &self.current {
            return Ok(current.id.clone());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let fresh = |s: &StoredSession| now.saturating_sub(s.last_activity) < self.timeout.as_millis() as i64;
        let (session, recovered) = match self.store.get::<StoredSession>(SESSION_STORAGE_KEY) {
            Some(stored) if fresh(&stored) => {
                debug!(session_id = %stored.id, "start_session: recovering persisted session");
                (
                    StoredSession {
                        last_activity: now,
                        ..stored
                    },
                    true,
                )
            }
            _ => (
                StoredSession {
                    id: generate_session_id(),
                    started_at: now,
                    last_activity: now,
                },
                false,
            ),
        };

        if let Err(e) = self.store.set(SESSION_STORAGE_KEY, &session) {
            warn!(error = %e, "start_session: failed to persist session");
        }
        self.state.set(StateUpdate::SessionId(Some(session.id.clone()))).await?;
        self.state.set(StateUpdate::HasStartSession(true)).await?;

        self.events.track(EventPayload::SessionStart { recovered }).await?;
        self.events.flush_pending_events().await?;

        self.port.publish(SessionMessage {
            origin: self.handle_id.clone(),
            kind: SessionMessageKind::Started {
                session_id: session.id.clone(),
            },
        });

        let id = session.id.clone();
        self.current = Some(session);
        self.arm_deadline();
        Ok(id)
    }

    fn touch(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        let Some(current) = &mut self.current else { return };
        current.last_activity = now;
        let snapshot = current.clone();
        if let Err(e) = self.store.set(SESSION_STORAGE_KEY, &snapshot) {
            warn!(error = %e, "touch: failed to persist session");
        }
        self.arm_deadline();
        self.port.publish(SessionMessage {
            origin: self.handle_id.clone(),
            kind: SessionMessageKind::Activity,
        });
    }

    fn set_visibility(&mut self, visible: bool) {
        if self.visible == visible {
            return;
        }
        self.visible = visible;
        if visible {
            debug!("set_visibility: visible, resuming inactivity timer");
            if let Some(current) = &mut self.current {
                current.last_activity = chrono::Utc::now().timestamp_millis();
            }
            self.arm_deadline();
        } else {
            // Hidden surfaces produce no activity; the timer pauses instead
            // of ending sessions behind the user's back.
            debug!("set_visibility: hidden, pausing inactivity timer");
            self.deadline = None;
        }
    }

    async fn end_session(&mut self, reason: SessionEndReason) {
        let Some(session) = self.current.take() else { return };
        debug!(session_id = %session.id, ?reason, "end_session");

        // Emit while the state still carries the session id so the event is
        // attributed to the session it closes.
        if let Err(e) = self.events.track(EventPayload::SessionEnd { reason }).await {
            warn!(error = %e, "end_session: failed to track session_end");
        }

        let _ = self.state.set(StateUpdate::SessionId(None)).await;
        let _ = self.state.set(StateUpdate::HasStartSession(false)).await;
        if let Err(e) = self.store.remove_item(SESSION_STORAGE_KEY) {
            warn!(error = %e, "end_session: failed to clear persisted session");
        }

        self.port.publish(SessionMessage {
            origin: self.handle_id.clone(),
            kind: SessionMessageKind::Ended { session_id: session.id },
        });
        self.deadline = None;
    }

    async fn handle_peer(&mut self, message: SessionMessage) {
        if message.origin == self.handle_id {
            return;
        }
        match message.kind {
            SessionMessageKind::Started { session_id } => {
                debug!(%session_id, "handle_peer: adopting peer session");
                let now = chrono::Utc::now().timestamp_millis();
                self.current = Some(StoredSession {
                    id: session_id.clone(),
                    started_at: now,
                    last_activity: now,
                });
                let _ = self.state.set(StateUpdate::SessionId(Some(session_id))).await;
                let _ = self.state.set(StateUpdate::HasStartSession(true)).await;
                if let Err(e) = self.events.flush_pending_events().await {
                    warn!(error = %e, "handle_peer: pending flush failed");
                }
                self.arm_deadline();
            }
            SessionMessageKind::Ended { session_id } => {
                if self.current.as_ref().is_some_and(|c| c.id == session_id) {
                    debug!(%session_id, "handle_peer: peer ended the shared session");
                    // The peer already emitted session_end and cleared
                    // storage; only local state needs clearing.
                    self.current = None;
                    self.deadline = None;
                    let _ = self.state.set(StateUpdate::SessionId(None)).await;
                    let _ = self.state.set(StateUpdate::HasStartSession(false)).await;
                }
            }
            SessionMessageKind::Activity => {
                if let Some(current) = &mut self.current {
                    current.last_activity = chrono::Utc::now().timestamp_millis();
                    self.arm_deadline();
                }
            }
        }
    }

    fn arm_deadline(&mut self) {
        if self.visible && self.current.is_some() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to send commands to the SessionManager
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Start (or join) a session; returns the session id
    ///
    /// Idempotent: a second call while a session is live returns its id.
    pub async fn start_tracking(&self) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Start { reply })
            .await
            .map_err(|_| SessionError::ChannelError)?;
        rx.await.map_err(|_| SessionError::ChannelError)?
    }

    /// Note user activity; extends the inactivity deadline
    pub fn record_activity(&self) {
        let _ = self.tx.try_send(SessionCommand::Touch);
    }

    /// Report surface visibility; hidden pauses the inactivity timer
    pub async fn set_visibility(&self, visible: bool) {
        let _ = self.tx.send(SessionCommand::Visibility { visible }).await;
    }

    /// End the current session; resolves after the transition is committed
    pub async fn stop_tracking(&self, reason: SessionEndReason) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Stop { reason, reply })
            .await
            .map_err(|_| SessionError::ChannelError)?;
        rx.await.map_err(|_| SessionError::ChannelError)
    }

    /// Stop the watchdog task
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{ChannelBroadcast, NoopBroadcast};
    use crate::config::QaToggle;
    use crate::consent::ConsentHandle;
    use crate::events::{Event, EventBus};
    use crate::state::StateManager;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        session: SessionHandle,
        state: StateHandle,
        events: EventManager,
        store: Store,
        _dir: TempDir,
    }

    fn fixture_with(port: Arc<dyn SessionBroadcast>, timeout: Duration) -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let store = Store::open(Some(dir.path()), "test");
        let state = StateManager::spawn();
        let events = EventManager::new(
            state.clone(),
            Arc::new(EventBus::with_default_capacity()),
            ConsentHandle::new(),
            QaToggle::new(false),
        );
        let session = SessionManager::spawn(store.clone(), state.clone(), events.clone(), port, timeout);
        Fixture {
            session,
            state,
            events,
            store,
            _dir: dir,
        }
    }

    fn fixture(timeout: Duration) -> Fixture {
        fixture_with(Arc::new(NoopBroadcast::default()), timeout)
    }

    fn event_types(batch: &[Event]) -> Vec<&'static str> {
        batch.iter().map(|e| e.payload.event_type()).collect()
    }

    #[tokio::test]
    async fn test_start_creates_session_and_emits_start_event() {
        let f = fixture(Duration::from_secs(60));
        let id = f.session.start_tracking().await.expect("start");

        assert_eq!(f.state.session_id().await.expect("state"), Some(id.clone()));
        let batch = f.events.drain_batch();
        assert_eq!(event_types(&batch), vec!["session_start"]);
        assert!(matches!(
            batch[0].payload,
            EventPayload::SessionStart { recovered: false }
        ));

        // Session record persisted for recovery.
        let stored = f.store.get::<StoredSession>(SESSION_STORAGE_KEY).expect("stored");
        assert_eq!(stored.id, id);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let f = fixture(Duration::from_secs(60));
        let first = f.session.start_tracking().await.expect("start");
        let second = f.session.start_tracking().await.expect("start again");
        assert_eq!(first, second);
        // Only one session_start.
        assert_eq!(f.events.queue_length(), 1);
    }

    #[tokio::test]
    async fn test_fresh_stored_session_is_recovered() {
        let f = fixture(Duration::from_secs(60));
        let now = chrono::Utc::now().timestamp_millis();
        let stored = StoredSession {
            id: "111-aaaaaaaa".to_string(),
            started_at: now - 30_000,
            last_activity: now - 10_000,
        };
        f.store.set(SESSION_STORAGE_KEY, &stored).expect("seed");

        let id = f.session.start_tracking().await.expect("start");
        assert_eq!(id, "111-aaaaaaaa");
        let batch = f.events.drain_batch();
        assert!(matches!(
            batch[0].payload,
            EventPayload::SessionStart { recovered: true }
        ));
    }

    #[tokio::test]
    async fn test_stale_stored_session_starts_fresh() {
        let f = fixture(Duration::from_secs(60));
        let now = chrono::Utc::now().timestamp_millis();
        let stored = StoredSession {
            id: "222-bbbbbbbb".to_string(),
            started_at: now - 600_000,
            last_activity: now - 120_000,
        };
        f.store.set(SESSION_STORAGE_KEY, &stored).expect("seed");

        let id = f.session.start_tracking().await.expect("start");
        assert_ne!(id, "222-bbbbbbbb");
        assert!(matches!(
            f.events.drain_batch()[0].payload,
            EventPayload::SessionStart { recovered: false }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_ends_session() {
        let f = fixture(Duration::from_millis(100));
        f.session.start_tracking().await.expect("start");

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(f.state.session_id().await.expect("state"), None);
        let batch = f.events.drain_batch();
        assert_eq!(event_types(&batch), vec!["session_start", "session_end"]);
        assert!(matches!(
            batch[1].payload,
            EventPayload::SessionEnd {
                reason: SessionEndReason::Inactivity
            }
        ));
        // Persisted record cleared so the next start is fresh.
        assert!(f.store.get::<StoredSession>(SESSION_STORAGE_KEY).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_extends_the_deadline() {
        let f = fixture(Duration::from_millis(100));
        f.session.start_tracking().await.expect("start");

        tokio::time::sleep(Duration::from_millis(60)).await;
        f.session.record_activity();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // 120ms elapsed but only 60ms since the last activity.
        assert!(f.state.session_id().await.expect("state").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.state.session_id().await.expect("state"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_surface_pauses_the_timer() {
        let f = fixture(Duration::from_millis(100));
        f.session.start_tracking().await.expect("start");
        f.session.set_visibility(false).await;

        // Far past the timeout while hidden: session survives.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(f.state.session_id().await.expect("state").is_some());

        // Visible again: the timer resumes from now.
        f.session.set_visibility(true).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(f.state.session_id().await.expect("state").is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.state.session_id().await.expect("state"), None);
    }

    #[tokio::test]
    async fn test_manual_stop_emits_end_and_clears() {
        let f = fixture(Duration::from_secs(60));
        f.session.start_tracking().await.expect("start");
        f.session
            .stop_tracking(SessionEndReason::ManualStop)
            .await
            .expect("stop");

        assert_eq!(f.state.session_id().await.expect("state"), None);
        let batch = f.events.drain_batch();
        assert!(matches!(
            batch[1].payload,
            EventPayload::SessionEnd {
                reason: SessionEndReason::ManualStop
            }
        ));
        assert!(f.store.get::<StoredSession>(SESSION_STORAGE_KEY).is_none());
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let f = fixture(Duration::from_secs(60));
        f.session
            .stop_tracking(SessionEndReason::ManualStop)
            .await
            .expect("stop");
        assert_eq!(f.events.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_peer_handle_adopts_broadcast_session() {
        let project = format!("peer-adopt-{}", uuid::Uuid::now_v7());
        let a = fixture_with(Arc::new(ChannelBroadcast::join(&project)), Duration::from_secs(60));
        let b = fixture_with(Arc::new(ChannelBroadcast::join(&project)), Duration::from_secs(60));

        let id = a.session.start_tracking().await.expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(b.state.session_id().await.expect("state"), Some(id));
        // The adopting handle does not emit its own session_start.
        assert_eq!(b.events.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_peer_end_clears_adopted_session() {
        let project = format!("peer-end-{}", uuid::Uuid::now_v7());
        let a = fixture_with(Arc::new(ChannelBroadcast::join(&project)), Duration::from_secs(60));
        let b = fixture_with(Arc::new(ChannelBroadcast::join(&project)), Duration::from_secs(60));

        a.session.start_tracking().await.expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.state.session_id().await.expect("state").is_some());

        a.session
            .stop_tracking(SessionEndReason::ManualStop)
            .await
            .expect("stop");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.state.session_id().await.expect("state"), None);
    }
}
