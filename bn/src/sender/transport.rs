//! HTTP transport for batch delivery
//!
//! The async path carries an explicit timeout and maps everything reqwest
//! can fail with into the [`SendError`] taxonomy. The sync path is the
//! unload escape hatch: a detached thread fires a short blocking POST and
//! nobody awaits it, because the process may not survive an async
//! continuation.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::events::WirePayload;

use super::{SendError, classify_status};

/// Timeout for the fire-and-forget sync flush
pub const SYNC_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Delivery transport seam
///
/// Production uses [`HttpTransport`]; tests substitute scripted
/// implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one batch to one backend, classifying the outcome
    async fn deliver(&self, url: &str, payload: &WirePayload) -> Result<(), SendError>;

    /// Fire-and-forget delivery for the unload path; must not block or await
    fn deliver_sync(&self, url: &str, payload: &WirePayload);
}

/// reqwest-backed transport
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, SendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::transient(format!("http client build failed: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, url: &str, payload: &WirePayload) -> Result<(), SendError> {
        debug!(%url, events = payload.events.len(), "HttpTransport::deliver");
        let response = self.http.post(url).json(payload).send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::transient("request timeout")
            } else {
                SendError::transient(e.to_string())
            }
        })?;
        classify_status(response.status().as_u16())
    }

    fn deliver_sync(&self, url: &str, payload: &WirePayload) {
        // Serialize before leaving the caller's stack; the thread outlives it.
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "sync flush payload serialization failed");
                return;
            }
        };
        let url = url.to_string();
        debug!(%url, bytes = body.len(), "HttpTransport::deliver_sync: spawning");
        std::thread::spawn(move || {
            let client = match reqwest::blocking::Client::builder().timeout(SYNC_FLUSH_TIMEOUT).build() {
                Ok(client) => client,
                Err(_) => return,
            };
            let _ = client
                .post(&url)
                .header("content-type", "application/json")
                .body(body)
                .send();
        });
    }
}
