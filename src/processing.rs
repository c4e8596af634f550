#![forbid(unsafe_code)]

//! Registry of ids whose fetch is currently outstanding.
//!
//! Purely for visibility (`/status`). It does not stop two callers from
//! fetching the same id at once; the fetch service layers its own per-key
//! lock on top for that.

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;

#[derive(Default)]
pub struct ProcessingRegistry {
    ids: Mutex<HashSet<String>>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn mark_started(&self, id: &str) {
        self.ids.lock().insert(id.to_owned());
    }

    /// No-op when `id` is not registered.
    pub fn mark_finished(&self, id: &str) {
        self.ids.lock().remove(id);
    }

    pub fn count(&self) -> usize {
        self.ids.lock().len()
    }

    /// Registered ids, sorted so repeated calls render identically.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    /// Marks `id` as started and returns a guard that marks it finished when
    /// dropped: on success, on `?` early returns, on panic unwinding, and when
    /// the owning future is cancelled.
    pub fn track(self: &Arc<Self>, id: impl Into<String>) -> ProcessingGuard {
        let id = id.into();
        self.mark_started(&id);
        ProcessingGuard {
            registry: Arc::clone(self),
            id,
        }
    }
}

#[must_use = "the id is unregistered as soon as the guard is dropped"]
pub struct ProcessingGuard {
    registry: Arc<ProcessingRegistry>,
    id: String,
}

impl ProcessingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.registry.mark_finished(&self.id);
    }
}
