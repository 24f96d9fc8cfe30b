//! State manager messages
//!
//! Commands and responses for the actor pattern.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::Config;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    /// The actor has shut down and the command channel is closed
    #[error("State channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// The process-wide SDK state record
///
/// Created at init, torn down at destroy. Mutated only through
/// [`StateUpdate`] commands; reads return a snapshot clone.
#[derive(Debug, Clone, Default)]
pub struct State {
    /// Current session id, if a session is active
    pub session_id: Option<String>,
    /// Stable user identifier supplied by the host app
    pub user_id: Option<String>,
    /// Device descriptor
    pub device: Option<String>,
    /// Current page URL, updated on navigation
    pub page_url: Option<String>,
    /// Validated configuration snapshot for this session
    pub config: Option<Arc<Config>>,
    /// Whether a session_start event has been emitted this session
    pub has_start_session: bool,
    /// Set after navigation to ignore the scroll the browser restores
    pub suppress_next_scroll: bool,
    /// Whether any backend circuit breaker is currently open
    pub circuit_breaker_open: bool,
}

/// Single-key atomic updates to the state record
#[derive(Debug, Clone)]
pub enum StateUpdate {
    SessionId(Option<String>),
    UserId(Option<String>),
    Device(Option<String>),
    PageUrl(Option<String>),
    Config(Arc<Config>),
    HasStartSession(bool),
    SuppressNextScroll(bool),
    CircuitBreakerOpen(bool),
}

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    /// Snapshot the whole record
    Get {
        reply: oneshot::Sender<State>,
    },

    /// Apply a single-key update; the reply resolves once committed
    Set {
        update: StateUpdate,
        reply: oneshot::Sender<()>,
    },

    /// Stop the actor
    Shutdown,
}
