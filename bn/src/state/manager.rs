//! StateManager - actor that owns the shared State record
//!
//! Processes commands via channels for thread-safe access to the record.
//! `set` acknowledges only after the value is committed, which keeps
//! racing initializers well-ordered during startup.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::Config;

use super::messages::{State, StateCommand, StateError, StateResponse, StateUpdate};

/// Command channel depth; state commands are tiny and drain fast
const CHANNEL_CAPACITY: usize = 64;

/// The state actor; owns the record until shutdown
pub struct StateManager {
    state: State,
    rx: mpsc::Receiver<StateCommand>,
}

impl StateManager {
    /// Spawn the actor and return a handle to it
    pub fn spawn() -> StateHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let manager = Self {
            state: State::default(),
            rx,
        };
        tokio::spawn(manager.run());
        StateHandle { tx }
    }

    async fn run(mut self) {
        debug!("StateManager::run: actor started");
        while let Some(command) = self.rx.recv().await {
            match command {
                StateCommand::Get { reply } => {
                    let _ = reply.send(self.state.clone());
                }
                StateCommand::Set { update, reply } => {
                    self.apply(update);
                    // Ack after the mutation so awaiting callers observe
                    // their own write.
                    let _ = reply.send(());
                }
                StateCommand::Shutdown => {
                    debug!("StateManager::run: shutdown");
                    break;
                }
            }
        }
    }

    fn apply(&mut self, update: StateUpdate) {
        debug!(?update, "StateManager::apply");
        match update {
            StateUpdate::SessionId(value) => self.state.session_id = value,
            StateUpdate::UserId(value) => self.state.user_id = value,
            StateUpdate::Device(value) => self.state.device = value,
            StateUpdate::PageUrl(value) => self.state.page_url = value,
            StateUpdate::Config(value) => self.state.config = Some(value),
            StateUpdate::HasStartSession(value) => self.state.has_start_session = value,
            StateUpdate::SuppressNextScroll(value) => self.state.suppress_next_scroll = value,
            StateUpdate::CircuitBreakerOpen(value) => self.state.circuit_breaker_open = value,
        }
    }
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<StateCommand>,
}

impl StateHandle {
    /// Snapshot the current state
    pub async fn get(&self) -> StateResponse<State> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StateCommand::Get { reply })
            .await
            .map_err(|_| StateError::ChannelError)?;
        rx.await.map_err(|_| StateError::ChannelError)
    }

    /// Apply a single-key update; resolves once the value is committed
    pub async fn set(&self, update: StateUpdate) -> StateResponse<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StateCommand::Set { update, reply })
            .await
            .map_err(|_| StateError::ChannelError)?;
        rx.await.map_err(|_| StateError::ChannelError)
    }

    /// Current session id, if any
    pub async fn session_id(&self) -> StateResponse<Option<String>> {
        Ok(self.get().await?.session_id)
    }

    /// Current configuration snapshot, if init has completed
    pub async fn config(&self) -> StateResponse<Option<Arc<Config>>> {
        Ok(self.get().await?.config)
    }

    /// Stop the actor; subsequent commands fail with `ChannelError`
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }
}
