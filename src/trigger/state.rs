//! Serialized state transitions shared by every protocol variant.
//!
//! `TransitionCell` owns the visible [`TriggerState`] and a transition lock.
//! All state changes happen through a [`Transition`] guard, so activate,
//! deactivate and reconfigure on one instance are mutually exclusive while
//! `state()` stays readable during a slow start or stop.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::error::{ListenerError, TriggerError};

use super::TriggerState;

/// Visible state plus the per-instance transition lock.
#[derive(Debug, Default)]
pub struct TransitionCell {
    state: RwLock<TriggerState>,
    transition: Mutex<()>,
}

impl TransitionCell {
    /// Creates a cell in the `Inactive` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current visible state.
    #[must_use]
    pub fn state(&self) -> TriggerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the transition lock. Blocks while another transition runs.
    pub fn lock(&self) -> Result<Transition<'_>, TriggerError> {
        let guard = self
            .transition
            .lock()
            .map_err(|_| TriggerError::PoisonedLock { context: "trigger transition" })?;
        Ok(Transition { cell: self, _guard: guard })
    }

    fn set(&self, next: TriggerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// Exclusive access to a trigger's transitions.
#[derive(Debug)]
pub struct Transition<'a> {
    cell: &'a TransitionCell,
    _guard: MutexGuard<'a, ()>,
}

impl Transition<'_> {
    /// Current visible state.
    #[must_use]
    pub fn state(&self) -> TriggerState {
        self.cell.state()
    }

    /// INACTIVE/ERROR -> STARTING -> ACTIVE, or ERROR on failure.
    ///
    /// On failure `cleanup` runs best-effort (its error is only logged) and
    /// the original failure is returned wrapped with `name`. Calling this on an
    /// already active trigger is a no-op.
    pub fn activate<S, C>(&self, name: &str, start: S, cleanup: C) -> Result<(), TriggerError>
    where
        S: FnOnce() -> Result<(), ListenerError>,
        C: FnOnce() -> Result<(), ListenerError>,
    {
        if self.state() == TriggerState::Active {
            debug!(trigger = name, "activate on active trigger ignored");
            return Ok(());
        }

        self.cell.set(TriggerState::Starting);
        match start() {
            Ok(()) => {
                self.cell.set(TriggerState::Active);
                Ok(())
            }
            Err(source) => {
                self.cell.set(TriggerState::Error);
                if let Err(cleanup_err) = cleanup() {
                    warn!(trigger = name, error = %cleanup_err, "cleanup after failed activation failed");
                }
                Err(TriggerError::Activation {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// ACTIVE/ERROR -> SHUTTING_DOWN -> INACTIVE, or ERROR on failure.
    ///
    /// Calling this on an inactive trigger is a no-op.
    pub fn deactivate<S>(&self, name: &str, stop: S) -> Result<(), TriggerError>
    where
        S: FnOnce() -> Result<(), ListenerError>,
    {
        if self.state() == TriggerState::Inactive {
            debug!(trigger = name, "deactivate on inactive trigger ignored");
            return Ok(());
        }

        self.cell.set(TriggerState::ShuttingDown);
        match stop() {
            Ok(()) => {
                self.cell.set(TriggerState::Inactive);
                Ok(())
            }
            Err(source) => {
                self.cell.set(TriggerState::Error);
                Err(TriggerError::Deactivation {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn activate_passes_through_starting() {
        let cell = TransitionCell::new();
        let t = cell.lock().unwrap();
        let mut seen = None;
        t.activate(
            "t",
            || {
                seen = Some(cell.state());
                Ok(())
            },
            || Ok(()),
        )
        .unwrap();
        assert_eq!(seen, Some(TriggerState::Starting));
        assert_eq!(t.state(), TriggerState::Active);
    }

    #[test]
    fn failed_activation_cleans_up_and_wraps_name() {
        let cell = TransitionCell::new();
        let cleaned = AtomicUsize::new(0);
        let err = cell
            .lock()
            .unwrap()
            .activate(
                "orders-http",
                || Err(ListenerError::new("bind failed")),
                || {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                    Err(ListenerError::new("cleanup also failed"))
                },
            )
            .unwrap_err();

        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(cell.state(), TriggerState::Error);
        let TriggerError::Activation { name, source } = err else {
            panic!("expected activation error, got {err:?}");
        };
        assert_eq!(name, "orders-http");
        assert_eq!(source.message, "bind failed");
    }

    #[test]
    fn error_state_can_be_reactivated_or_deactivated() {
        let cell = TransitionCell::new();
        let _ = cell.lock().unwrap().activate("t", || Err(ListenerError::new("x")), || Ok(()));
        assert_eq!(cell.state(), TriggerState::Error);

        cell.lock().unwrap().deactivate("t", || Ok(())).unwrap();
        assert_eq!(cell.state(), TriggerState::Inactive);

        let _ = cell.lock().unwrap().activate("t", || Err(ListenerError::new("x")), || Ok(()));
        cell.lock().unwrap().activate("t", || Ok(()), || Ok(())).unwrap();
        assert_eq!(cell.state(), TriggerState::Active);
    }

    #[test]
    fn failed_deactivation_leaves_error() {
        let cell = TransitionCell::new();
        cell.lock().unwrap().activate("t", || Ok(()), || Ok(())).unwrap();
        let err = cell
            .lock()
            .unwrap()
            .deactivate("t", || Err(ListenerError::new("stuck")))
            .unwrap_err();
        assert!(matches!(err, TriggerError::Deactivation { .. }));
        assert_eq!(cell.state(), TriggerState::Error);
    }

    #[test]
    fn inactive_deactivate_and_active_activate_are_noops() {
        let cell = TransitionCell::new();
        cell.lock()
            .unwrap()
            .deactivate("t", || panic!("stop must not run"))
            .unwrap();
        cell.lock().unwrap().activate("t", || Ok(()), || Ok(())).unwrap();
        cell.lock()
            .unwrap()
            .activate("t", || panic!("start must not run"), || Ok(()))
            .unwrap();
        assert_eq!(cell.state(), TriggerState::Active);
    }

    #[test]
    fn transitions_are_mutually_exclusive() {
        let cell = Arc::new(TransitionCell::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cell = Arc::clone(&cell);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let body = || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    };
                    let t = cell.lock().unwrap();
                    if i % 2 == 0 {
                        t.activate("t", body, || Ok(())).unwrap();
                    } else {
                        t.deactivate("t", body).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_inside.load(Ordering::SeqCst) <= 1);
    }
}
