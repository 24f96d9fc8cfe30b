//! Integration tests for Beacon
//!
//! These tests verify end-to-end behavior of the tracking pipeline through
//! the public API: init, tracking, delivery, recovery, and teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serial_test::serial;
use tempfile::TempDir;

use beacon::broadcast::NoopBroadcast;
use beacon::config::AppConfig;
use beacon::events::WirePayload;
use beacon::sender::{SendError, Transport};
use beacon::tracker::Tracker;

/// Transport that accepts everything and records what it saw
#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<WirePayload>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, _url: &str, payload: &WirePayload) -> Result<(), SendError> {
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }

    fn deliver_sync(&self, _url: &str, payload: &WirePayload) {
        self.delivered.lock().unwrap().push(payload.clone());
    }
}

/// Transport where every attempt fails transiently
struct DownTransport;

#[async_trait]
impl Transport for DownTransport {
    async fn deliver(&self, _url: &str, _payload: &WirePayload) -> Result<(), SendError> {
        Err(SendError::transient("connection refused"))
    }

    fn deliver_sync(&self, _url: &str, _payload: &WirePayload) {}
}

fn app_config(dir: &TempDir, project_id: &str) -> AppConfig {
    AppConfig {
        project_id: project_id.to_string(),
        backend_urls: vec!["https://collect.example.com/v1".to_string()],
        storage_dir: Some(dir.path().to_path_buf()),
        max_retries: Some(0),
        ..Default::default()
    }
}

fn isolated_tracker(dir: &TempDir, project_id: &str, transport: Arc<dyn Transport>) -> Tracker {
    Tracker::new(app_config(dir, project_id))
        .with_transport(transport)
        .with_broadcast(Arc::new(NoopBroadcast::default()))
}

// =============================================================================
// Tracker Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_full_lifecycle_delivers_wire_envelope() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(RecordingTransport::default());
    let tracker = isolated_tracker(&dir, "lifecycle", Arc::clone(&transport) as Arc<dyn Transport>);

    tracker.init().await.expect("init should succeed");
    tracker
        .event("purchase", serde_json::Map::new())
        .await
        .expect("tracking should succeed");
    tracker.flush().await.expect("flush should succeed");
    tracker.destroy(false).await;

    let delivered = transport.delivered.lock().unwrap();
    assert!(!delivered.is_empty(), "batches should have been delivered");

    // The wire envelope is snake_case JSON with typed events.
    let wire = serde_json::to_value(&delivered[0]).expect("serialize");
    assert!(wire.get("session_id").is_some());
    assert!(wire.get("user_id").is_some());
    let events = wire.get("events").and_then(|e| e.as_array()).expect("events array");
    assert_eq!(events[0].get("type").and_then(|t| t.as_str()), Some("session_start"));
    assert!(events[0].get("timestamp").is_some());
    assert!(events[0].get("page_url").is_some());

    let all_types: Vec<&str> = delivered
        .iter()
        .flat_map(|p| p.events.iter().map(|e| e.payload.event_type()))
        .collect();
    assert!(all_types.contains(&"custom"));
    assert!(all_types.contains(&"session_end"), "destroy must flush session_end");
}

#[tokio::test]
async fn test_destroy_then_reinit_starts_a_new_session() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(RecordingTransport::default());
    let tracker = isolated_tracker(&dir, "reinit", Arc::clone(&transport) as Arc<dyn Transport>);

    tracker.init().await.expect("first init");
    let first = tracker.session_id().await.expect("session").expect("live session");
    tracker.destroy(false).await;

    tracker.init().await.expect("second init");
    let second = tracker.session_id().await.expect("session").expect("live session");
    assert_ne!(first, second, "destroy ends the session; re-init starts fresh");
    tracker.destroy(false).await;
}

#[tokio::test]
async fn test_repeated_destroy_init_cycles_leave_no_residue() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(RecordingTransport::default());
    let tracker = isolated_tracker(&dir, "cycles", Arc::clone(&transport) as Arc<dyn Transport>);

    // Several full cycles; each must stand alone.
    let mut sessions = std::collections::HashSet::new();
    for _ in 0..3 {
        tracker.init().await.expect("init");
        sessions.insert(tracker.session_id().await.expect("session").expect("live session"));
        tracker.destroy(false).await;
    }
    assert_eq!(sessions.len(), 3, "every cycle should mint a fresh session");

    // After the cycles, one tracked event produces exactly one delivery and
    // one bus emission; a pipeline task or subscription surviving a destroy
    // would double either count.
    tracker.init().await.expect("final init");
    let mut rx = tracker.on_event().expect("subscribe");
    tracker
        .event("after_cycles", serde_json::Map::new())
        .await
        .expect("track");
    tracker.flush().await.expect("flush");

    let seen = rx.recv().await.expect("recv");
    assert_eq!(seen.payload.event_type(), "custom");
    assert!(rx.try_recv().is_err(), "exactly one emission for one event");

    let delivered = transport.delivered.lock().unwrap();
    let copies = delivered
        .iter()
        .flat_map(|p| p.events.iter())
        .filter(|e| matches!(&e.payload, beacon::events::EventPayload::Custom { name, .. } if name == "after_cycles"))
        .count();
    assert_eq!(copies, 1, "exactly one delivery for one event");
    drop(delivered);
    tracker.destroy(false).await;
}

// =============================================================================
// Session Recovery Tests
// =============================================================================

#[tokio::test]
async fn test_session_survives_a_crash() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(RecordingTransport::default());

    // First tracker is dropped without destroy, as after a process crash.
    let crashed = isolated_tracker(&dir, "crashy", Arc::clone(&transport) as Arc<dyn Transport>);
    crashed.init().await.expect("init");
    let original = crashed.session_id().await.expect("session").expect("live session");
    drop(crashed);

    let restarted = isolated_tracker(&dir, "crashy", Arc::clone(&transport) as Arc<dyn Transport>);
    restarted.init().await.expect("init after crash");
    let recovered = restarted.session_id().await.expect("session").expect("live session");
    assert_eq!(recovered, original, "a fresh stored session should be recovered");
    restarted.destroy(false).await;
}

// =============================================================================
// Delivery Recovery Tests
// =============================================================================

#[tokio::test]
async fn test_persisted_batches_resent_on_next_init() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    // Backend down: the flushed batch exhausts its budget and is persisted.
    let offline = isolated_tracker(&dir, "store-fwd", Arc::new(DownTransport));
    offline.init().await.expect("init");
    offline
        .event("while_offline", serde_json::Map::new())
        .await
        .expect("track");
    offline.flush().await.expect("flush");
    drop(offline);

    // Backend is back: init replays the persisted batch.
    let transport = Arc::new(RecordingTransport::default());
    let online = isolated_tracker(&dir, "store-fwd", Arc::clone(&transport) as Arc<dyn Transport>);
    online.init().await.expect("init");

    let delivered = transport.delivered.lock().unwrap();
    let replayed: Vec<&str> = delivered
        .iter()
        .flat_map(|p| p.events.iter().map(|e| e.payload.event_type()))
        .collect();
    assert!(replayed.contains(&"custom"), "the offline event should be replayed");
    drop(delivered);
    online.destroy(false).await;
}

// =============================================================================
// Multi-Handle Session Sync Tests
// =============================================================================

#[tokio::test]
#[serial]
async fn test_handles_of_one_project_share_a_session() {
    let dir_a = TempDir::new().expect("Failed to create temp dir");
    let dir_b = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(RecordingTransport::default());
    let project = format!("shared-{}", uuid::Uuid::now_v7());

    // Real broadcast port: handles discover each other by project id.
    let a = Tracker::new(app_config(&dir_a, &project)).with_transport(Arc::clone(&transport) as Arc<dyn Transport>);
    let b = Tracker::new(app_config(&dir_b, &project)).with_transport(Arc::clone(&transport) as Arc<dyn Transport>);

    a.init().await.expect("init a");
    b.init().await.expect("init b");
    // The later start wins: the broadcast converges both handles onto it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let session_a = a.session_id().await.expect("session").expect("live session");
    let session_b = b.session_id().await.expect("session").expect("live session");
    assert_eq!(session_a, session_b, "both handles should share one session");

    a.destroy(false).await;
    b.destroy(false).await;
}

#[tokio::test]
#[serial]
async fn test_peer_session_end_propagates() {
    let dir_a = TempDir::new().expect("Failed to create temp dir");
    let dir_b = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(RecordingTransport::default());
    let project = format!("propagate-{}", uuid::Uuid::now_v7());

    let a = Tracker::new(app_config(&dir_a, &project)).with_transport(Arc::clone(&transport) as Arc<dyn Transport>);
    let b = Tracker::new(app_config(&dir_b, &project)).with_transport(Arc::clone(&transport) as Arc<dyn Transport>);

    a.init().await.expect("init a");
    b.init().await.expect("init b");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Destroying one handle ends the shared session everywhere.
    a.destroy(false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.session_id().await.expect("session"), None);

    b.destroy(false).await;
}
