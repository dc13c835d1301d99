//! Process-scoped registry of live trigger handles.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::TriggerError;
use crate::trigger::{TriggerHandle, TriggerId};

fn lock_err() -> TriggerError {
    TriggerError::PoisonedLock { context: "trigger registry" }
}

/// Concurrent map from trigger id to its live handle.
///
/// The registry holds at most one handle per id; `put` replaces and returns
/// any previous entry. Callers that must not replace a live handle serialize
/// per id (see [`crate::lifecycle::TriggerLifecycleManager`]).
#[derive(Default)]
pub struct TriggerRegistry {
    handles: RwLock<HashMap<TriggerId, TriggerHandle>>,
}

impl TriggerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under its id, returning the previous handle if any.
    pub fn put(&self, handle: TriggerHandle) -> Result<Option<TriggerHandle>, TriggerError> {
        let mut handles = self.handles.write().map_err(|_| lock_err())?;
        Ok(handles.insert(handle.id().clone(), handle))
    }

    /// Live handle for `id`.
    pub fn get(&self, id: &TriggerId) -> Result<Option<TriggerHandle>, TriggerError> {
        let handles = self.handles.read().map_err(|_| lock_err())?;
        Ok(handles.get(id).cloned())
    }

    /// Removes and returns the handle for `id`.
    pub fn remove(&self, id: &TriggerId) -> Result<Option<TriggerHandle>, TriggerError> {
        let mut handles = self.handles.write().map_err(|_| lock_err())?;
        Ok(handles.remove(id))
    }

    /// Drops every handle without touching its state.
    pub fn clear(&self) -> Result<(), TriggerError> {
        self.handles.write().map_err(|_| lock_err())?.clear();
        Ok(())
    }

    /// Snapshot of every registered handle.
    pub fn all(&self) -> Result<Vec<TriggerHandle>, TriggerError> {
        let handles = self.handles.read().map_err(|_| lock_err())?;
        Ok(handles.values().cloned().collect())
    }

    /// Empties the registry and applies `f` to every handle it held.
    ///
    /// The map is swapped out in one step so a handle registered concurrently
    /// is either swept or left registered, never dropped unvisited. `f` runs
    /// without the registry lock held. Returns the number of handles swept.
    pub fn sweep<F>(&self, mut f: F) -> Result<usize, TriggerError>
    where
        F: FnMut(&TriggerHandle),
    {
        let handles = std::mem::take(&mut *self.handles.write().map_err(|_| lock_err())?);
        for handle in handles.values() {
            f(handle);
        }
        Ok(handles.len())
    }

    /// Number of registered handles.
    pub fn len(&self) -> Result<usize, TriggerError> {
        Ok(self.handles.read().map_err(|_| lock_err())?.len())
    }

    /// Returns true if no handle is registered.
    pub fn is_empty(&self) -> Result<bool, TriggerError> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.handles.read().map(|h| h.len()).unwrap_or_default();
        f.debug_struct("TriggerRegistry").field("len", &len).finish()
    }
}
