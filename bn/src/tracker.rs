//! Tracker - the public facade
//!
//! One `Tracker` per surface. `init` resolves configuration, spins up the
//! actors, recovers persisted batches, and starts (or joins) the session;
//! `destroy` tears everything down with a final flush. Concurrent `init`
//! calls coalesce onto one initialization; every caller observes the same
//! outcome.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use beaconstore::Store;

use crate::broadcast::{ChannelBroadcast, SessionBroadcast};
use crate::config::{AppConfig, Config, ConfigManager, QaToggle};
use crate::consent::{ConsentCategory, ConsentHandle, ConsentState};
use crate::events::{Event, EventBus, EventError, EventManager, EventPayload, SessionEndReason, TrackOutcome};
use crate::sender::{HttpTransport, SenderManager, Transport};
use crate::session::{SESSION_STORAGE_KEY, SessionError, SessionHandle, SessionManager, StoredSession};
use crate::state::{StateError, StateHandle, StateManager, StateUpdate};

/// Errors surfaced by the tracker facade
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A tracking call arrived before `init` (or after `destroy`)
    #[error("tracker is not initialized")]
    NotInitialized,

    /// Initialization failed; the tracker is back in the idle phase
    #[error("initialization failed: {0}")]
    InitFailed(String),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Everything a ready tracker owns
struct Core {
    config: Arc<Config>,
    store: Store,
    state: StateHandle,
    events: EventManager,
    session: SessionHandle,
    sender: Arc<SenderManager>,
    bus: Arc<EventBus>,
    consent: ConsentHandle,
    qa: QaToggle,
    pipeline: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

enum InitPhase {
    Idle,
    /// An init is in flight; later callers park here for its outcome
    Initializing {
        waiters: Vec<oneshot::Sender<Result<(), String>>>,
    },
    Ready(Arc<Core>),
}

/// The SDK entry point
pub struct Tracker {
    app: AppConfig,
    phase: Mutex<InitPhase>,
    transport_override: Option<Arc<dyn Transport>>,
    broadcast_override: Option<Arc<dyn SessionBroadcast>>,
}

impl Tracker {
    /// Create an uninitialized tracker from raw configuration
    pub fn new(app: AppConfig) -> Self {
        Self {
            app,
            phase: Mutex::new(InitPhase::Idle),
            transport_override: None,
            broadcast_override: None,
        }
    }

    /// Substitute the delivery transport (tests)
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    /// Substitute the session broadcast port (tests, isolated handles)
    pub fn with_broadcast(mut self, port: Arc<dyn SessionBroadcast>) -> Self {
        self.broadcast_override = Some(port);
        self
    }

    /// Initialize the tracker
    ///
    /// Resolves configuration (remote overlay included), opens storage,
    /// spawns the state and session actors, recovers batches persisted by
    /// earlier runs, starts the session, and launches the flush pipeline.
    /// Idempotent once ready; concurrent callers share one initialization.
    pub async fn init(&self) -> Result<(), TrackerError> {
        let waiter = {
            let mut phase = self.lock_phase();
            match &mut *phase {
                InitPhase::Ready(_) => return Ok(()),
                InitPhase::Initializing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                InitPhase::Idle => {
                    *phase = InitPhase::Initializing { waiters: Vec::new() };
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(TrackerError::InitFailed(reason)),
                Err(_) => Err(TrackerError::InitFailed("initializer dropped".to_string())),
            };
        }

        let result = self.do_init().await;

        let waiters = {
            let mut phase = self.lock_phase();
            let waiters = match std::mem::replace(&mut *phase, InitPhase::Idle) {
                InitPhase::Initializing { waiters } => waiters,
                other => {
                    *phase = other;
                    Vec::new()
                }
            };
            if let Ok(core) = &result {
                *phase = InitPhase::Ready(Arc::clone(core));
            }
            waiters
        };

        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        result.map(|_| ())
    }

    async fn do_init(&self) -> Result<Arc<Core>, TrackerError> {
        let resolver = ConfigManager::new(std::time::Duration::from_millis(
            crate::config::DEFAULT_REQUEST_TIMEOUT_MS,
        ))
        .map_err(|e| TrackerError::InitFailed(e.to_string()))?;
        let (config, warnings) = resolver.get(self.app.clone()).await;
        for warning in &warnings {
            warn!(%warning, "config warning");
        }
        let config = Arc::new(config);

        let store = Store::open(config.storage_dir.as_deref(), &config.project_id);
        let qa = QaToggle::new(config.mode.is_qa());
        let consent = ConsentHandle::new();
        let bus = Arc::new(EventBus::with_default_capacity());

        let state = StateManager::spawn();
        state.set(StateUpdate::Config(Arc::clone(&config))).await?;
        state.set(StateUpdate::UserId(config.user_id.clone())).await?;
        state.set(StateUpdate::Device(config.device.clone())).await?;
        state.set(StateUpdate::PageUrl(config.page_url.clone())).await?;

        let events = EventManager::new(state.clone(), Arc::clone(&bus), consent.clone(), qa.clone());

        let transport: Arc<dyn Transport> = match &self.transport_override {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(
                HttpTransport::new(config.request_timeout).map_err(|e| TrackerError::InitFailed(e.to_string()))?,
            ),
        };
        let sender = Arc::new(SenderManager::new(
            transport,
            state.clone(),
            store.clone(),
            qa.clone(),
            &config,
        ));

        let port: Arc<dyn SessionBroadcast> = match &self.broadcast_override {
            Some(port) => Arc::clone(port),
            None => Arc::new(ChannelBroadcast::join(&config.project_id)),
        };
        let session = SessionManager::spawn(
            store.clone(),
            state.clone(),
            events.clone(),
            port,
            config.session_timeout,
        );

        let recovered = sender.recover_persisted_events().await;
        if recovered > 0 {
            info!(recovered, "resent batches persisted by earlier runs");
        }

        session.start_tracking().await?;

        let shutdown = Arc::new(Notify::new());
        let pipeline = spawn_pipeline(
            events.clone(),
            Arc::clone(&sender),
            config.flush_interval,
            Arc::clone(&shutdown),
        );

        info!(project_id = %config.project_id, mode = ?config.mode, "tracker initialized");
        Ok(Arc::new(Core {
            config,
            store,
            state,
            events,
            session,
            sender,
            bus,
            consent,
            qa,
            pipeline,
            shutdown,
        }))
    }

    /// Tear the tracker down
    ///
    /// Ends the session, flushes whatever is queued, and stops every task.
    /// With `sync_flush` the final batch goes out fire-and-forget (the
    /// unload path); otherwise it is delivered with the normal retry
    /// machinery. Idempotent: destroying an idle tracker is a no-op.
    pub async fn destroy(&self, sync_flush: bool) {
        let core = {
            let mut phase = self.lock_phase();
            match std::mem::replace(&mut *phase, InitPhase::Idle) {
                InitPhase::Ready(core) => core,
                other => {
                    *phase = other;
                    return;
                }
            }
        };

        core.shutdown.notify_waiters();
        if let Err(e) = core.session.stop_tracking(SessionEndReason::Destroy).await {
            warn!(error = %e, "destroy: session stop failed");
        }

        let batch = core.events.drain_batch();
        if sync_flush {
            core.sender.flush_immediately_sync(batch);
        } else {
            let report = core.sender.send_events_queue(batch).await;
            debug!(batch_id = %report.batch_id, "destroy: final flush done");
        }

        core.session.shutdown().await;
        core.state.shutdown().await;
        core.pipeline.abort();
        info!("tracker destroyed");
    }

    /// Track a custom event
    pub async fn event(&self, name: &str, metadata: Map<String, Value>) -> Result<TrackOutcome, TrackerError> {
        self.track(EventPayload::Custom {
            name: name.to_string(),
            metadata,
        })
        .await
    }

    /// Track any event payload
    ///
    /// Every tracked interaction also counts as activity for the session
    /// inactivity timer.
    pub async fn track(&self, payload: EventPayload) -> Result<TrackOutcome, TrackerError> {
        let core = self.core()?;
        core.session.record_activity();
        Ok(core.events.track(payload).await?)
    }

    /// Record a navigation: update the page URL and track a page view
    ///
    /// The next scroll event is suppressed; it is the restored scroll
    /// position of the new page, not a user scroll.
    pub async fn navigate(
        &self,
        url: &str,
        referrer: Option<String>,
        title: Option<String>,
    ) -> Result<TrackOutcome, TrackerError> {
        let core = self.core()?;
        core.state.set(StateUpdate::PageUrl(Some(url.to_string()))).await?;
        core.state.set(StateUpdate::SuppressNextScroll(true)).await?;
        self.track(EventPayload::PageView { referrer, title }).await
    }

    /// Subscribe to enriched events as they are accepted into the queue
    pub fn on_event(&self) -> Result<broadcast::Receiver<Event>, TrackerError> {
        Ok(self.core()?.bus.subscribe())
    }

    /// Drain the queue and deliver it now, outside the periodic schedule
    pub async fn flush(&self) -> Result<usize, TrackerError> {
        let core = self.core()?;
        let batch = core.events.drain_batch();
        let count = batch.len();
        if count > 0 {
            core.sender.send_events_queue(batch).await;
        }
        Ok(count)
    }

    /// Current queue length
    pub fn queue_length(&self) -> Result<usize, TrackerError> {
        Ok(self.core()?.events.queue_length())
    }

    /// Current session id, if a session is live
    pub async fn session_id(&self) -> Result<Option<String>, TrackerError> {
        Ok(self.core()?.state.session_id().await?)
    }

    /// The persisted session record: id, start time, last activity
    pub fn session_data(&self) -> Result<Option<StoredSession>, TrackerError> {
        Ok(self.core()?.store.get::<StoredSession>(SESSION_STORAGE_KEY))
    }

    /// The resolved configuration snapshot
    pub fn config(&self) -> Result<Arc<Config>, TrackerError> {
        Ok(Arc::clone(&self.core()?.config))
    }

    /// Report surface visibility; hidden pauses the inactivity timer
    pub async fn set_visibility(&self, visible: bool) -> Result<(), TrackerError> {
        self.core()?.session.set_visibility(visible).await;
        Ok(())
    }

    /// Grant or revoke a consent category
    ///
    /// Granting analytics replays events buffered while consent was out.
    pub async fn set_consent(&self, category: ConsentCategory, granted: bool) -> Result<(), TrackerError> {
        let core = self.core()?;
        core.consent.set(category, granted);
        if granted && category == ConsentCategory::Analytics {
            core.events.flush_pending_events().await?;
        }
        Ok(())
    }

    /// Snapshot the consent state
    pub fn consent_state(&self) -> Result<ConsentState, TrackerError> {
        Ok(self.core()?.consent.snapshot())
    }

    /// Flip QA mode at runtime
    pub fn set_qa_mode(&self, on: bool) -> Result<(), TrackerError> {
        self.core()?.qa.set(on);
        Ok(())
    }

    fn core(&self) -> Result<Arc<Core>, TrackerError> {
        match &*self.lock_phase() {
            InitPhase::Ready(core) => Ok(Arc::clone(core)),
            _ => Err(TrackerError::NotInitialized),
        }
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, InitPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The flush pipeline: threshold-or-timer batching
fn spawn_pipeline(
    events: EventManager,
    sender: Arc<SenderManager>,
    interval: std::time::Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let flush_signal = events.flush_signal();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate; consume it so the loop starts with a
        // full interval.
        ticker.tick().await;
        debug!("pipeline: started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = flush_signal.notified() => {}
                _ = shutdown.notified() => break,
            }
            let batch = events.drain_batch();
            if batch.is_empty() {
                continue;
            }
            let count = batch.len();
            let report = sender.send_events_queue(batch).await;
            debug!(batch_id = %report.batch_id, count, accepted = report.accepted_by.len(), "pipeline: batch sent");
        }
        debug!("pipeline: stopped");
    })
}
