//! BeaconStore - namespaced persistent JSON key/value storage
//!
//! Backs the Beacon SDK's session recovery and failed-batch persistence.
//! Values are JSON documents; keys are namespaced as
//! `beacon:{project_id}:{key}` so several projects can share one store file
//! without collisions.
//!
//! # Architecture
//!
//! ```text
//! {data_dir}/beaconstore/
//! ├── {project_id}.json       # one JSON object per project namespace
//! └── {project_id}.json.lock  # fs2 advisory lock for cross-process writes
//! ```
//!
//! Storage is best-effort by design: if the backing directory cannot be
//! created or written, the store degrades to an in-memory backend and the SDK
//! keeps running without persistence.
//!
//! # Example
//!
//! ```ignore
//! use beaconstore::Store;
//!
//! let store = Store::open(None, "my-project");
//! store.set_item("session", serde_json::json!({"id": "123-456"}))?;
//! let session = store.get_item("session");
//! ```

pub mod cli;
mod store;

pub use store::{FileBackend, MemoryBackend, Store, StorageBackend, StorageError};

/// Fixed prefix for every key written by the store
pub const KEY_PREFIX: &str = "beacon";

/// Directory name under the platform data dir holding store files
pub const STORE_DIR_NAME: &str = "beaconstore";
