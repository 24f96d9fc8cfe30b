//! SenderManager - multi-backend delivery with retry and recovery
//!
//! Dispatches each batch to every configured backend in parallel. Transient
//! failures retry on a jittered exponential schedule; permanent failures
//! short-circuit that backend for the batch; exhausted batches are persisted
//! so a later init can recover them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use beaconstore::Store;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, QaToggle};
use crate::events::{Event, WirePayload};
use crate::state::{StateHandle, StateUpdate};

use super::backoff::{BackoffManager, with_jitter};
use super::circuit::CircuitBreaker;
use super::transport::Transport;
use super::SendError;

/// Base delay for delivery retries
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Growth factor per retry
pub const RETRY_MULTIPLIER: f64 = 2.0;

/// Cap on the retry delay
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

/// Storage key prefix for batches parked for crash recovery
pub const PERSISTED_BATCH_KEY_PREFIX: &str = "batch:";

/// Cap on parked batches per backend; oldest are evicted first
pub const MAX_PERSISTED_BATCHES_PER_BACKEND: usize = 10;

/// Parked batches older than this are dropped at recovery (24 hours)
pub const PERSISTED_BATCH_MAX_AGE_MS: i64 = 86_400_000;

/// A batch persisted after its retry budget ran out for one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBatch {
    pub url: String,
    pub payload: WirePayload,
    /// Unix millis when the batch was parked
    pub persisted_at: i64,
}

/// One backend's failure for a batch
#[derive(Debug, Clone)]
pub struct BackendFailure {
    pub url: String,
    pub error: SendError,
    /// Whether the batch was parked in storage for a recovery pass
    pub persisted: bool,
}

/// Internal attempt failure, tagged with how it arose
struct AttemptFailure {
    error: SendError,
    /// The open circuit skipped the attempt; there is no new information
    /// about the batch, so it must not be parked again
    circuit_skipped: bool,
}

/// Outcome of one batch dispatch
///
/// Failures are data, not errors: the pipeline keeps running and the host
/// page is never interrupted by delivery problems.
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    /// Correlation id for log lines about this batch
    pub batch_id: String,
    /// Backends that accepted the batch
    pub accepted_by: Vec<String>,
    /// Backends that did not
    pub failed: Vec<BackendFailure>,
    /// QA mode logged the batch instead of sending it
    pub qa_logged: bool,
}

impl SendReport {
    /// Whether at least one backend accepted the batch
    pub fn any_accepted(&self) -> bool {
        !self.accepted_by.is_empty() || self.qa_logged
    }
}

/// The delivery engine
pub struct SenderManager {
    transport: Arc<dyn Transport>,
    state: StateHandle,
    store: Store,
    qa: QaToggle,
    backends: Vec<String>,
    max_retries: u32,
    retry_initial: Duration,
    retry_max: Duration,
    circuits: Mutex<HashMap<String, CircuitBreaker>>,
}

impl SenderManager {
    /// Create a sender for the configured backends
    pub fn new(
        transport: Arc<dyn Transport>,
        state: StateHandle,
        store: Store,
        qa: QaToggle,
        config: &Config,
    ) -> Self {
        Self {
            transport,
            state,
            store,
            qa,
            backends: config.backend_urls.clone(),
            max_retries: config.max_retries,
            retry_initial: RETRY_INITIAL_DELAY,
            retry_max: RETRY_MAX_DELAY,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retry delay schedule (tests)
    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max;
        self
    }

    /// Dispatch a batch to every backend in parallel
    ///
    /// The batch has already left the queue; this reports what happened per
    /// backend and parks transiently-failed copies in storage.
    pub async fn send_events_queue(&self, batch: Vec<Event>) -> SendReport {
        if batch.is_empty() {
            return SendReport::default();
        }
        let batch_id = Uuid::now_v7().to_string();
        let payload = self.build_payload(batch).await;

        if self.qa.enabled() {
            info!(
                batch_id,
                payload = %serde_json::to_string(&payload).unwrap_or_default(),
                "qa: batch logged instead of sent"
            );
            return SendReport {
                batch_id,
                qa_logged: true,
                ..Default::default()
            };
        }

        let attempts = self
            .backends
            .iter()
            .map(|url| self.attempt_backend(url.clone(), &payload, &batch_id));
        let outcomes = join_all(attempts).await;

        let mut report = SendReport {
            batch_id: batch_id.clone(),
            ..Default::default()
        };
        for (url, outcome) in self.backends.iter().cloned().zip(outcomes) {
            match outcome {
                Ok(()) => report.accepted_by.push(url),
                Err(AttemptFailure { error, circuit_skipped }) => {
                    let persisted = if error.is_permanent() {
                        warn!(%url, %error, batch_id, "backend dropped batch permanently");
                        false
                    } else if circuit_skipped {
                        debug!(%url, batch_id, "circuit open, batch not parked");
                        false
                    } else {
                        self.persist_batch(&url, &payload, &batch_id)
                    };
                    report.failed.push(BackendFailure { url, error, persisted });
                }
            }
        }

        self.publish_circuit_state().await;
        debug!(
            batch_id,
            accepted = report.accepted_by.len(),
            failed = report.failed.len(),
            "send_events_queue: done"
        );
        report
    }

    /// Fire-and-forget delivery for the unload path
    ///
    /// No awaits, no retries, no classification: the page may die before any
    /// continuation runs. Batches are best-effort here.
    pub fn flush_immediately_sync(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let payload = payload_from_events(batch);
        if self.qa.enabled() {
            info!(
                payload = %serde_json::to_string(&payload).unwrap_or_default(),
                "qa: sync flush logged instead of sent"
            );
            return;
        }
        for url in &self.backends {
            self.transport.deliver_sync(url, &payload);
        }
    }

    /// Re-send batches persisted by earlier sessions
    ///
    /// Run once at startup. One attempt per batch: success and permanent
    /// rejection both clear the persisted copy, transient failure keeps it
    /// for the next init.
    pub async fn recover_persisted_events(&self) -> usize {
        let keys: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(PERSISTED_BATCH_KEY_PREFIX))
            .collect();
        if keys.is_empty() {
            return 0;
        }
        info!(count = keys.len(), "recovering persisted batches");

        let now = chrono::Utc::now().timestamp_millis();
        let mut recovered = 0;
        for key in keys {
            let Some(batch) = self.store.get::<PersistedBatch>(&key) else {
                // Unreadable entries are dead weight; drop them.
                let _ = self.store.remove_item(&key);
                continue;
            };
            if now.saturating_sub(batch.persisted_at) > PERSISTED_BATCH_MAX_AGE_MS {
                warn!(url = %batch.url, "persisted batch expired, dropping");
                let _ = self.store.remove_item(&key);
                continue;
            }
            match self.transport.deliver(&batch.url, &batch.payload).await {
                Ok(()) => {
                    recovered += 1;
                    let _ = self.store.remove_item(&key);
                }
                Err(error) if error.is_permanent() => {
                    warn!(url = %batch.url, %error, "persisted batch rejected permanently, dropping");
                    let _ = self.store.remove_item(&key);
                }
                Err(error) => {
                    debug!(url = %batch.url, %error, "persisted batch still undeliverable");
                }
            }
        }
        recovered
    }

    async fn attempt_backend(&self, url: String, payload: &WirePayload, batch_id: &str) -> Result<(), AttemptFailure> {
        if self.circuit_open(&url) {
            debug!(%url, batch_id, "circuit open, skipping backend");
            return Err(AttemptFailure {
                error: SendError::transient("circuit open"),
                circuit_skipped: true,
            });
        }

        let mut backoff = BackoffManager::new(self.retry_initial, RETRY_MULTIPLIER, self.retry_max);
        let mut retries = 0;
        loop {
            match self.transport.deliver(&url, payload).await {
                Ok(()) => {
                    self.record_success(&url);
                    return Ok(());
                }
                Err(error) if error.is_permanent() => {
                    // Not a backend-health signal; leave the circuit alone.
                    return Err(AttemptFailure {
                        error,
                        circuit_skipped: false,
                    });
                }
                Err(error) => {
                    self.record_failure(&url);
                    if retries >= self.max_retries || self.circuit_open(&url) {
                        return Err(AttemptFailure {
                            error,
                            circuit_skipped: false,
                        });
                    }
                    retries += 1;
                    let delay = with_jitter(backoff.next_delay());
                    debug!(%url, batch_id, retries, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn build_payload(&self, batch: Vec<Event>) -> WirePayload {
        // Prefer the live state snapshot; during destroy the actor may
        // already be gone, in which case the events carry their own identity.
        match self.state.get().await {
            Ok(snapshot) => WirePayload {
                user_id: snapshot.user_id,
                session_id: snapshot
                    .session_id
                    .unwrap_or_else(|| batch.first().map(|e| e.session_id.clone()).unwrap_or_default()),
                device: snapshot.device,
                events: batch,
            },
            Err(_) => payload_from_events(batch),
        }
    }

    fn persist_batch(&self, url: &str, payload: &WirePayload, batch_id: &str) -> bool {
        let record = PersistedBatch {
            url: url.to_string(),
            payload: payload.clone(),
            persisted_at: chrono::Utc::now().timestamp_millis(),
        };
        let tag = stable_backend_tag(url);
        let key = format!("{PERSISTED_BATCH_KEY_PREFIX}{batch_id}:{tag}");
        match self.store.set(&key, &record) {
            Ok(()) => {
                self.evict_persisted_overflow(&tag);
                info!(%url, batch_id, "batch persisted for recovery");
                true
            }
            Err(e) => {
                warn!(%url, batch_id, error = %e, "failed to persist batch, dropping");
                false
            }
        }
    }

    /// Keep at most [`MAX_PERSISTED_BATCHES_PER_BACKEND`] parked batches per
    /// backend, evicting oldest first like the event queue does
    fn evict_persisted_overflow(&self, tag: &str) {
        let suffix = format!(":{tag}");
        let mut keys: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(PERSISTED_BATCH_KEY_PREFIX) && k.ends_with(&suffix))
            .collect();
        if keys.len() <= MAX_PERSISTED_BATCHES_PER_BACKEND {
            return;
        }
        // Batch ids are v7 uuids, so lexical key order is chronological.
        keys.sort();
        let excess = keys.len() - MAX_PERSISTED_BATCHES_PER_BACKEND;
        for key in keys.into_iter().take(excess) {
            warn!(%key, "persisted batch cap reached, oldest dropped");
            let _ = self.store.remove_item(&key);
        }
    }

    fn circuit_open(&self, url: &str) -> bool {
        let circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        circuits.get(url).is_some_and(|c| c.is_open(Instant::now()))
    }

    fn record_failure(&self, url: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        circuits
            .entry(url.to_string())
            .or_default()
            .record_failure(Instant::now());
    }

    fn record_success(&self, url: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        circuits.entry(url.to_string()).or_default().record_success();
    }

    async fn publish_circuit_state(&self) {
        let any_open = {
            let circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            circuits.values().any(|c| c.is_open(now))
        };
        // Best-effort: state may already be torn down during destroy.
        let _ = self.state.set(StateUpdate::CircuitBreakerOpen(any_open)).await;
    }
}

fn payload_from_events(batch: Vec<Event>) -> WirePayload {
    let first = batch.first();
    WirePayload {
        user_id: first.and_then(|e| e.user_id.clone()),
        session_id: first.map(|e| e.session_id.clone()).unwrap_or_default(),
        device: first.and_then(|e| e.device.clone()),
        events: batch,
    }
}

fn stable_backend_tag(url: &str) -> String {
    // Short, filesystem-safe discriminator so two backends never collide on
    // one persisted key.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in url.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}
