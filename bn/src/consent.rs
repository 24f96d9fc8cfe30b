//! Consent state for tracking categories
//!
//! Beacon runs an opt-out model: analytics consent is granted until the host
//! app revokes it. Events tracked while consent is revoked are parked in the
//! pending buffer, not dropped, so granting consent later releases them.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Consent categories the host app can grant or revoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentCategory {
    /// Interaction and custom events
    Analytics,
    /// Session bookkeeping required for the SDK to operate
    Functional,
}

/// Snapshot of granted categories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentState {
    granted: HashSet<ConsentCategory>,
}

impl Default for ConsentState {
    fn default() -> Self {
        // Opt-out: everything granted until revoked.
        Self {
            granted: HashSet::from([ConsentCategory::Analytics, ConsentCategory::Functional]),
        }
    }
}

impl ConsentState {
    /// Whether a category is currently granted
    pub fn is_granted(&self, category: ConsentCategory) -> bool {
        self.granted.contains(&category)
    }

    /// Granted categories, for reporting to the host app
    pub fn granted(&self) -> Vec<ConsentCategory> {
        let mut categories: Vec<_> = self.granted.iter().copied().collect();
        categories.sort_by_key(|c| format!("{c:?}"));
        categories
    }
}

/// Shared, mutable consent handle
#[derive(Clone, Default)]
pub struct ConsentHandle {
    inner: Arc<RwLock<ConsentState>>,
}

impl ConsentHandle {
    /// Create a handle with the default (opt-out) state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a category is currently granted
    pub fn is_granted(&self, category: ConsentCategory) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_granted(category)
    }

    /// Grant or revoke a category
    pub fn set(&self, category: ConsentCategory, granted: bool) {
        debug!(?category, granted, "ConsentHandle::set");
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if granted {
            state.granted.insert(category);
        } else {
            state.granted.remove(&category);
        }
    }

    /// Snapshot the current state
    pub fn snapshot(&self) -> ConsentState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
