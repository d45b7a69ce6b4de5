//! A process-wide cache of open [`HistoryFacade`]s, keyed by
//! `(workspace, project)`.
//!
//! Not a hidden global: callers construct and own exactly one `Registry`
//! for the process's lifetime and pass it around explicitly.

use crate::error::Result;
use crate::facade::HistoryFacade;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Caches one [`HistoryFacade`] per `(workspace, project)` pair so callers
/// don't re-open the same log files on every lookup.
pub struct Registry {
    facades: Mutex<HashMap<(String, String), Arc<HistoryFacade>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Registry {
            facades: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached facade for `(workspace, project)`, opening it
    /// with default rotation thresholds on first access.
    pub fn get(&self, workspace: &str, project: &str) -> Result<Arc<HistoryFacade>> {
        let key = (workspace.to_string(), project.to_string());
        let mut facades = self.facades.lock().expect("registry mutex poisoned");
        if let Some(existing) = facades.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let facade = Arc::new(HistoryFacade::open(workspace, project)?);
        facades.insert(key, Arc::clone(&facade));
        Ok(facade)
    }

    /// Drop the cached facade for `(workspace, project)`, if any, so the
    /// next [`get`](Self::get) reopens it from disk.
    pub fn evict(&self, workspace: &str, project: &str) {
        let key = (workspace.to_string(), project.to_string());
        self.facades
            .lock()
            .expect("registry mutex poisoned")
            .remove(&key);
    }

    /// Number of facades currently cached.
    pub fn len(&self) -> usize {
        self.facades.lock().expect("registry mutex poisoned").len()
    }

    /// Whether the registry currently holds no facades.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
