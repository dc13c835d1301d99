//! Idempotent single-trigger activation and deactivation.
//!
//! The manager is the only writer of the [`TriggerRegistry`]. Operations on
//! the same trigger id are serialized through a per-id lock table, so two
//! concurrent reactivations of one trigger can never leave two live handles.
//! Once [`TriggerLifecycleManager::shutdown_all`] has started, no activation
//! can leave a handle registered or a listener running.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::availability::AvailabilityCache;
use crate::error::{GatewayResult, TriggerError};
use crate::registry::TriggerRegistry;
use crate::trigger::{TriggerFactory, TriggerId, TriggerSample, TriggerState};

/// Action applied to one trigger, or to every trigger of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerAction {
    /// Start listening (replacing any live handle).
    Activate,
    /// Stop listening.
    Deactivate,
    /// Toggle based on the sample's last known state.
    Switch,
    /// Deactivate, then activate.
    ReActivate,
    /// Cross-instance reconciliation; same effect as `ReActivate`.
    Sync,
}

impl fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Switch => "switch",
            Self::ReActivate => "re-activate",
            Self::Sync => "sync",
        };
        f.write_str(s)
    }
}

/// Result of a successful [`TriggerLifecycleManager::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The trigger is live and registered.
    Activated,
    /// The availability probe reported the target unreachable; nothing started.
    SkippedUnavailable,
}

/// Orchestrates activate/deactivate against the registry and a protocol factory.
pub struct TriggerLifecycleManager {
    registry: Arc<TriggerRegistry>,
    factory: Arc<dyn TriggerFactory>,
    probe_availability: bool,
    closed: AtomicBool,
    // One entry per trigger id ever touched; bounded by the configured trigger set.
    id_locks: Mutex<HashMap<TriggerId, Arc<Mutex<()>>>>,
}

impl TriggerLifecycleManager {
    /// Creates a manager writing to `registry` and building instances with `factory`.
    #[must_use]
    pub fn new(registry: Arc<TriggerRegistry>, factory: Arc<dyn TriggerFactory>, probe_availability: bool) -> Self {
        Self {
            registry,
            factory,
            probe_availability,
            closed: AtomicBool::new(false),
            id_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registry this manager writes to.
    #[must_use]
    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    fn id_lock(&self, id: &TriggerId) -> Result<Arc<Mutex<()>>, TriggerError> {
        let mut locks = self
            .id_locks
            .lock()
            .map_err(|_| TriggerError::PoisonedLock { context: "lifecycle id locks" })?;
        Ok(Arc::clone(locks.entry(id.clone()).or_default()))
    }

    /// Activates `sample`, deactivating any live handle for the same id first.
    ///
    /// When availability probing is enabled and the target is unreachable the
    /// activation is skipped and logged; this is not an error.
    ///
    /// After [`shutdown_all`](Self::shutdown_all) has begun this fails with
    /// [`TriggerError::ShutDown`], stopping the listener again if it was
    /// started concurrently with the shutdown.
    pub fn activate(&self, sample: &TriggerSample, cache: &AvailabilityCache) -> GatewayResult<ActivationOutcome> {
        let lock = self.id_lock(&sample.id)?;
        let _serial = lock
            .lock()
            .map_err(|_| TriggerError::PoisonedLock { context: "lifecycle id lock" })?;

        if self.is_closed() {
            return Err(TriggerError::ShutDown { id: sample.id.clone() }.into());
        }
        self.deactivate_locked(&sample.id, true)?;

        let handle = self.factory.create(sample)?;
        if self.probe_availability && !handle.check_if_server_available(cache) {
            info!(
                trigger = %sample.id,
                transport = %sample.transport(),
                "target unreachable, activation skipped"
            );
            return Ok(ActivationOutcome::SkippedUnavailable);
        }

        handle.activate()?;
        self.registry.put(Arc::clone(&handle))?;

        // Registered before the flag check, so a sweep that began after it
        // sees the handle; otherwise we withdraw it ourselves.
        if self.is_closed() {
            self.registry.remove(&sample.id)?;
            if let Err(err) = handle.deactivate() {
                warn!(trigger = %sample.id, error = %err, "deactivation after late activation failed");
            }
            info!(trigger = %sample.id, "activation finished after shutdown, listener stopped");
            return Err(TriggerError::ShutDown { id: sample.id.clone() }.into());
        }

        info!(trigger = %sample.id, name = %sample.name, "trigger activated");
        Ok(ActivationOutcome::Activated)
    }

    /// True once [`shutdown_all`](Self::shutdown_all) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deactivates the live handle for `id`.
    ///
    /// Returns `false` (with a warning) if nothing is registered. The handle is
    /// removed from the registry even when its deactivation fails; the failure
    /// is still returned.
    pub fn deactivate(&self, id: &TriggerId) -> GatewayResult<bool> {
        let lock = self.id_lock(id)?;
        let _serial = lock
            .lock()
            .map_err(|_| TriggerError::PoisonedLock { context: "lifecycle id lock" })?;
        self.deactivate_locked(id, false)
    }

    fn deactivate_locked(&self, id: &TriggerId, replacing: bool) -> GatewayResult<bool> {
        let Some(handle) = self.registry.get(id)? else {
            if !replacing {
                warn!(trigger = %id, "deactivate requested for trigger with no live handle");
            }
            return Ok(false);
        };

        if replacing {
            debug!(trigger = %id, "deactivating stale handle before reactivation");
        }
        let result = handle.deactivate();
        self.registry.remove(id)?;
        result?;
        info!(trigger = %id, "trigger deactivated");
        Ok(true)
    }

    /// Applies `action` to one trigger and returns the resulting state.
    ///
    /// `Switch` toggles on the sample's last known state: ACTIVE becomes
    /// INACTIVE, anything else becomes ACTIVE. A skipped activation yields
    /// INACTIVE.
    pub fn apply(
        &self,
        action: TriggerAction,
        sample: &TriggerSample,
        cache: &AvailabilityCache,
    ) -> GatewayResult<TriggerState> {
        match action {
            TriggerAction::Activate => self.activate_state(sample, cache),
            TriggerAction::Deactivate => self.deactivate(&sample.id).map(|_| TriggerState::Inactive),
            TriggerAction::Switch => {
                if sample.state == TriggerState::Active {
                    self.deactivate(&sample.id).map(|_| TriggerState::Inactive)
                } else {
                    self.activate_state(sample, cache)
                }
            }
            TriggerAction::ReActivate | TriggerAction::Sync => {
                self.deactivate(&sample.id)?;
                self.activate_state(sample, cache)
            }
        }
    }

    fn activate_state(&self, sample: &TriggerSample, cache: &AvailabilityCache) -> GatewayResult<TriggerState> {
        Ok(match self.activate(sample, cache)? {
            ActivationOutcome::Activated => TriggerState::Active,
            ActivationOutcome::SkippedUnavailable => TriggerState::Inactive,
        })
    }

    /// Current state of `id` as seen by the registry; INACTIVE when absent.
    pub fn state_of(&self, id: &TriggerId) -> GatewayResult<TriggerState> {
        Ok(self
            .registry
            .get(id)?
            .map_or(TriggerState::Inactive, |handle| handle.state()))
    }

    /// Deactivates every registered trigger and clears the registry.
    ///
    /// The manager is closed first, so later activations fail and activations
    /// already in flight stop their own listener. Individual failures are
    /// logged. Returns the number of handles swept.
    pub fn shutdown_all(&self) -> GatewayResult<usize> {
        self.closed.store(true, Ordering::SeqCst);
        let swept = self.registry.sweep(|handle| {
            if let Err(err) = handle.deactivate() {
                warn!(trigger = %handle.id(), error = %err, "deactivation during shutdown failed");
            }
        })?;
        info!(swept, "all triggers deactivated");
        Ok(swept)
    }
}

impl fmt::Debug for TriggerLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerLifecycleManager")
            .field("registry", &self.registry)
            .field("probe_availability", &self.probe_availability)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
