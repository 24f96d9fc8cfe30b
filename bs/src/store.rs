//! Core Store implementation
//!
//! A `Store` wraps a [`StorageBackend`] behind a namespace: every key is
//! written as `beacon:{project_id}:{key}`. The file backend serializes the
//! whole namespace map as one JSON object and guards read-modify-write cycles
//! with an fs2 advisory lock so concurrent SDK handles do not clobber each
//! other.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{KEY_PREFIX, STORE_DIR_NAME};

/// Errors surfaced by storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure (open, read, write, rename, lock)
    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document could not be parsed or a value could not be encoded
    #[error("storage serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Backend contract: a flat map of fully-namespaced keys to JSON values
pub trait StorageBackend: Send {
    /// Read a single value
    fn get_item(&mut self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a single value
    fn set_item(&mut self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove a single value; removing a missing key is not an error
    fn remove_item(&mut self, key: &str) -> Result<(), StorageError>;

    /// All keys currently present
    fn keys(&mut self) -> Result<Vec<String>, StorageError>;

    /// Remove every key
    fn clear(&mut self) -> Result<(), StorageError>;
}

/// File-backed storage: one JSON object per project, lock file alongside
pub struct FileBackend {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileBackend {
    /// Create a file backend for the given store file
    ///
    /// Fails if the parent directory cannot be created or the lock file
    /// cannot be opened; callers are expected to fall back to memory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = lock_path_for(&path);
        // Probe the lock file now so an unwritable location fails at open
        // time rather than on the first tracked event.
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)?;
        debug!(path = %path.display(), "FileBackend::open");
        Ok(Self { path, lock_path })
    }

    fn locked<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> Result<(T, bool), StorageError>,
    ) -> Result<T, StorageError> {
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)?;
        lock_file.lock_exclusive()?;
        let result = (|| {
            let mut map = self.read_map()?;
            let (value, dirty) = f(&mut map)?;
            if dirty {
                self.write_map(&map)?;
            }
            Ok(value)
        })();
        // Unlock regardless of outcome; drop would release it anyway but an
        // explicit unlock keeps the failure path obvious.
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn read_map(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        let mut file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        match serde_json::from_str(&content) {
            Ok(map) => Ok(map),
            Err(e) => {
                // A corrupt store file must not wedge the SDK; start fresh.
                warn!(path = %self.path.display(), error = %e, "store file corrupt, resetting");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_map(&self, map: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&serde_json::to_vec(map)?)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

impl StorageBackend for FileBackend {
    fn get_item(&mut self, key: &str) -> Result<Option<Value>, StorageError> {
        self.locked(|map| Ok((map.get(key).cloned(), false)))
    }

    fn set_item(&mut self, key: &str, value: Value) -> Result<(), StorageError> {
        self.locked(|map| {
            map.insert(key.to_string(), value);
            Ok(((), true))
        })
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        self.locked(|map| {
            let removed = map.remove(key).is_some();
            Ok(((), removed))
        })
    }

    fn keys(&mut self) -> Result<Vec<String>, StorageError> {
        self.locked(|map| Ok((map.keys().cloned().collect(), false)))
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.locked(|map| {
            let dirty = !map.is_empty();
            map.clear();
            Ok(((), dirty))
        })
    }
}

/// In-memory fallback backend for environments without usable persistence
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: BTreeMap<String, Value>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get_item(&mut self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.map.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: Value) -> Result<(), StorageError> {
        self.map.insert(key.to_string(), value);
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        self.map.remove(key);
        Ok(())
    }

    fn keys(&mut self) -> Result<Vec<String>, StorageError> {
        Ok(self.map.keys().cloned().collect())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.map.clear();
        Ok(())
    }
}

/// Namespaced key/value store handle
///
/// Cheap to clone; all clones share one backend. Construction never fails:
/// when the file backend is unusable the store silently runs memory-only and
/// reports `is_persistent() == false`.
#[derive(Clone)]
pub struct Store {
    backend: Arc<Mutex<Box<dyn StorageBackend>>>,
    project_id: String,
    persistent: bool,
}

impl Store {
    /// Open a store for a project, file-backed when possible
    ///
    /// `base_dir` overrides the platform data dir (used by tests and the CLI).
    pub fn open(base_dir: Option<&Path>, project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let dir = base_dir.map(Path::to_path_buf).unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(STORE_DIR_NAME)
        });
        let path = dir.join(format!("{project_id}.json"));
        match FileBackend::open(&path) {
            Ok(backend) => Self {
                backend: Arc::new(Mutex::new(Box::new(backend))),
                project_id,
                persistent: true,
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "persistent storage unavailable, using memory-only store");
                Self::in_memory(project_id)
            }
        }
    }

    /// Open a memory-only store (no persistence across restarts)
    pub fn in_memory(project_id: impl Into<String>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Box::new(MemoryBackend::new()))),
            project_id: project_id.into(),
            persistent: false,
        }
    }

    /// Whether values survive a restart
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// The project id this store is namespaced under
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{KEY_PREFIX}:{}:{key}", self.project_id)
    }

    fn namespace_prefix(&self) -> String {
        format!("{KEY_PREFIX}:{}:", self.project_id)
    }

    fn with_backend<T>(&self, f: impl FnOnce(&mut Box<dyn StorageBackend>) -> T) -> T {
        let mut guard = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Read a raw JSON value; storage failures degrade to `None` with a warning
    pub fn get_item(&self, key: &str) -> Option<Value> {
        let full_key = self.namespaced(key);
        match self.with_backend(|b| b.get_item(&full_key)) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "storage read failed");
                None
            }
        }
    }

    /// Write a raw JSON value
    pub fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let full_key = self.namespaced(key);
        self.with_backend(|b| b.set_item(&full_key, value))
    }

    /// Remove a value; missing keys are not an error
    pub fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let full_key = self.namespaced(key);
        self.with_backend(|b| b.remove_item(&full_key))
    }

    /// Keys present in this project's namespace, prefix stripped
    pub fn keys(&self) -> Vec<String> {
        let prefix = self.namespace_prefix();
        match self.with_backend(|b| b.keys()) {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(error = %e, "storage key scan failed");
                Vec::new()
            }
        }
    }

    /// Remove every key in this project's namespace
    ///
    /// Other projects sharing the store file are untouched.
    pub fn clear(&self) -> Result<(), StorageError> {
        let prefix = self.namespace_prefix();
        self.with_backend(|b| {
            let keys = b.keys()?;
            for key in keys.iter().filter(|k| k.starts_with(&prefix)) {
                b.remove_item(key)?;
            }
            Ok(())
        })
    }

    /// Typed read helper; undecodable values degrade to `None` with a warning
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_item(key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key, error = %e, "stored value has unexpected shape");
                None
            }
        }
    }

    /// Typed write helper
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.set_item(key, serde_json::to_value(value)?)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("project_id", &self.project_id)
            .field("persistent", &self.persistent)
            .finish()
    }
}
