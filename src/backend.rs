//! Backend execution RPC seam.
//!
//! The backend owns authoritative trigger configuration. This crate only
//! fetches [`TriggerSample`] snapshots from it and pushes state updates back.
//! [`InMemoryBackend`] is a thread-safe reference implementation intended for
//! embedded usage and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::trigger::{EnvironmentId, ProjectId, TriggerId, TriggerSample, TriggerState};

/// State update pushed to the backend after a trigger action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStateUpdate {
    /// Trigger id.
    pub trigger_id: TriggerId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Resulting state.
    pub state: TriggerState,
    /// Failure description when `state` is ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the state was reached.
    pub at: DateTime<Utc>,
}

/// Synchronous RPC surface of the backend.
///
/// Implementations should handle concurrent access safely; the bulk
/// coordinator calls `push_trigger_state` from many fan-out threads at once.
pub trait ExecutionBackend: Send + Sync {
    /// Fetches one trigger by id.
    fn fetch_trigger(&self, id: &TriggerId) -> Result<Option<TriggerSample>, BackendError>;

    /// Fetches every trigger of one environment.
    fn fetch_environment_triggers(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> Result<Vec<TriggerSample>, BackendError>;

    /// Fetches every trigger of one project.
    fn fetch_project_triggers(&self, project_id: &ProjectId) -> Result<Vec<TriggerSample>, BackendError>;

    /// Fetches every trigger that should be live on this instance at startup.
    fn fetch_active_triggers(&self) -> Result<Vec<TriggerSample>, BackendError>;

    /// Records a trigger's new state.
    fn push_trigger_state(&self, update: &TriggerStateUpdate) -> Result<(), BackendError>;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    samples: RwLock<BTreeMap<TriggerId, TriggerSample>>,
    pushed: RwLock<Vec<TriggerStateUpdate>>,
    failing_fetches: AtomicU32,
    reject_pushes: AtomicBool,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend seeded with `samples`.
    #[must_use]
    pub fn with_samples(samples: impl IntoIterator<Item = TriggerSample>) -> Self {
        let backend = Self::new();
        for sample in samples {
            backend.upsert(sample);
        }
        backend
    }

    /// Inserts or replaces a sample.
    pub fn upsert(&self, sample: TriggerSample) {
        self.samples
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sample.id.clone(), sample);
    }

    /// Makes the next `count` fetch calls fail with `Unavailable`.
    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Makes every state push fail with `Rejected`.
    pub fn reject_pushes(&self, reject: bool) {
        self.reject_pushes.store(reject, Ordering::SeqCst);
    }

    /// Every state update pushed so far, in arrival order.
    #[must_use]
    pub fn pushed_updates(&self) -> Vec<TriggerStateUpdate> {
        self.pushed.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_fetch(&self) -> Result<(), BackendError> {
        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(BackendError::Unavailable {
                message: "simulated fetch failure".to_string(),
            }),
            Err(_) => Ok(()),
        }
    }

    fn filtered<F>(&self, keep: F) -> Vec<TriggerSample>
    where
        F: Fn(&TriggerSample) -> bool,
    {
        self.samples
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| keep(s))
            .cloned()
            .collect()
    }
}

impl ExecutionBackend for InMemoryBackend {
    fn fetch_trigger(&self, id: &TriggerId) -> Result<Option<TriggerSample>, BackendError> {
        self.check_fetch()?;
        Ok(self
            .samples
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    fn fetch_environment_triggers(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> Result<Vec<TriggerSample>, BackendError> {
        self.check_fetch()?;
        Ok(self.filtered(|s| &s.project_id == project_id && &s.environment_id == environment_id))
    }

    fn fetch_project_triggers(&self, project_id: &ProjectId) -> Result<Vec<TriggerSample>, BackendError> {
        self.check_fetch()?;
        Ok(self.filtered(|s| &s.project_id == project_id))
    }

    fn fetch_active_triggers(&self) -> Result<Vec<TriggerSample>, BackendError> {
        self.check_fetch()?;
        Ok(self.filtered(|s| s.state == TriggerState::Active))
    }

    fn push_trigger_state(&self, update: &TriggerStateUpdate) -> Result<(), BackendError> {
        if self.reject_pushes.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected {
                message: format!("state push for {} rejected", update.trigger_id),
            });
        }
        self.pushed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update.clone());
        Ok(())
    }
}
