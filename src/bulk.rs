//! Bulk activation: one action fanned out over many triggers.
//!
//! The whole batch is submitted as one task to the fan-out pool and every
//! sample is processed in parallel. A failing (or panicking) item is recorded
//! as ERROR and never aborts its siblings. The caller collects outcomes until
//! the batch completes or the wait budget runs out; giving up only stops the
//! caller from waiting, in-flight items still run to completion and their
//! late outcomes are discarded.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::availability::AvailabilityCache;
use crate::backend::{ExecutionBackend, TriggerStateUpdate};
use crate::lifecycle::{TriggerAction, TriggerLifecycleManager};
use crate::pool::{panic_message, ThreadPoolProvider};
use crate::trigger::{ProjectId, TriggerId, TriggerSample, TriggerState};

/// Outcome of one item of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Resulting state.
    pub state: TriggerState,
    /// Failure description when `state` is ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    fn ok(state: TriggerState) -> Self {
        Self { state, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            state: TriggerState::Error,
            error: Some(error),
        }
    }
}

/// Aggregate result of one bulk run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    /// Action applied.
    pub action: TriggerAction,
    /// False iff at least one collected item ended in ERROR.
    pub success: bool,
    /// Collected per-trigger outcomes.
    pub states: BTreeMap<TriggerId, ItemOutcome>,
    /// Items still running when the wait budget ran out.
    pub pending: usize,
    /// Shared error text naming every failed item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BulkOperationResult {
    fn empty(action: TriggerAction) -> Self {
        Self {
            action,
            success: true,
            states: BTreeMap::new(),
            pending: 0,
            error_message: None,
        }
    }

    /// Number of collected items in `state`.
    #[must_use]
    pub fn count(&self, state: TriggerState) -> usize {
        self.states.values().filter(|o| o.state == state).count()
    }

    /// True when every submitted item reported back.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// Per-trigger states without error texts.
    #[must_use]
    pub fn state_map(&self) -> BTreeMap<TriggerId, TriggerState> {
        self.states.iter().map(|(id, o)| (id.clone(), o.state)).collect()
    }

    /// Folds `other` into this result.
    pub fn merge(&mut self, other: Self) {
        self.success &= other.success;
        self.pending += other.pending;
        self.states.extend(other.states);
        self.error_message = match (self.error_message.take(), other.error_message) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
    }
}

/// Per (project, outcome) counters.
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    counts: Mutex<HashMap<(ProjectId, TriggerState), u64>>,
}

impl OutcomeCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, project_id: &ProjectId, state: TriggerState) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry((project_id.clone(), state)).or_default() += 1;
    }

    /// Count for one project and outcome.
    #[must_use]
    pub fn get(&self, project_id: &ProjectId, state: TriggerState) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(project_id.clone(), state))
            .copied()
            .unwrap_or(0)
    }

    /// Every non-zero counter, sorted by project then state.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ProjectId, TriggerState, u64)> {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = counts.iter().map(|((p, s), n)| (p.clone(), *s, *n)).collect();
        out.sort();
        out
    }
}

/// Shared per-item context moved into the fan-out task.
struct ItemContext {
    lifecycle: Arc<TriggerLifecycleManager>,
    backend: Arc<dyn ExecutionBackend>,
    counters: Arc<OutcomeCounters>,
    cache: AvailabilityCache,
    action: TriggerAction,
}

impl ItemContext {
    fn run(&self, sample: &TriggerSample) -> ItemOutcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.lifecycle.apply(self.action, sample, &self.cache)
        }));

        let outcome = match result {
            Ok(Ok(state)) => {
                debug!(trigger = %sample.id, action = %self.action, %state, "bulk item done");
                ItemOutcome::ok(state)
            }
            Ok(Err(err)) => {
                error!(trigger = %sample.id, action = %self.action, error = %err, "bulk item failed");
                ItemOutcome::failed(err.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(trigger = %sample.id, action = %self.action, panic = %message, "bulk item panicked");
                ItemOutcome::failed(format!("panicked: {message}"))
            }
        };

        self.counters.increment(&sample.project_id, outcome.state);
        self.push_state(sample, &outcome);
        outcome
    }

    fn push_state(&self, sample: &TriggerSample, outcome: &ItemOutcome) {
        let update = TriggerStateUpdate {
            trigger_id: sample.id.clone(),
            project_id: sample.project_id.clone(),
            state: outcome.state,
            error: outcome.error.clone(),
            at: Utc::now(),
        };
        if let Err(err) = self.backend.push_trigger_state(&update) {
            warn!(trigger = %sample.id, state = %outcome.state, error = %err, "state push failed");
        }
    }
}

/// Applies one action to a batch of triggers in parallel.
pub struct BulkActivationCoordinator {
    lifecycle: Arc<TriggerLifecycleManager>,
    backend: Arc<dyn ExecutionBackend>,
    pools: Arc<ThreadPoolProvider>,
    counters: Arc<OutcomeCounters>,
    max_wait: Duration,
    probe_timeout: Duration,
}

impl BulkActivationCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        lifecycle: Arc<TriggerLifecycleManager>,
        backend: Arc<dyn ExecutionBackend>,
        pools: Arc<ThreadPoolProvider>,
        max_wait: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            backend,
            pools,
            counters: Arc::new(OutcomeCounters::new()),
            max_wait,
            probe_timeout,
        }
    }

    /// Per-project outcome counters.
    #[must_use]
    pub fn counters(&self) -> &OutcomeCounters {
        &self.counters
    }

    /// Runs `action` over `samples`, waiting at most the configured budget.
    pub fn run(&self, action: TriggerAction, samples: Vec<TriggerSample>) -> BulkOperationResult {
        self.run_with_timeout(action, samples, self.max_wait)
    }

    /// Runs `action` over `samples`, waiting at most `max_wait`.
    ///
    /// Samples sharing an id are collapsed (last one wins) so the result holds
    /// one entry per trigger.
    pub fn run_with_timeout(
        &self,
        action: TriggerAction,
        samples: Vec<TriggerSample>,
        max_wait: Duration,
    ) -> BulkOperationResult {
        let unique: BTreeMap<TriggerId, TriggerSample> =
            samples.into_iter().map(|s| (s.id.clone(), s)).collect();
        let batch: Vec<TriggerSample> = unique.into_values().collect();
        let expected = batch.len();
        if expected == 0 {
            return BulkOperationResult::empty(action);
        }

        let started = Instant::now();
        let deadline = started + max_wait;
        info!(%action, batch = expected, "bulk run started");

        let ctx = ItemContext {
            lifecycle: Arc::clone(&self.lifecycle),
            backend: Arc::clone(&self.backend),
            counters: Arc::clone(&self.counters),
            cache: AvailabilityCache::new(self.probe_timeout),
            action,
        };
        let (tx, rx) = unbounded::<(TriggerId, ItemOutcome)>();
        self.pools.fan_out().spawn(move || {
            batch.par_iter().for_each_with(tx, |tx, sample| {
                let outcome = ctx.run(sample);
                // The caller may have stopped waiting; late outcomes are dropped.
                let _ = tx.send((sample.id.clone(), outcome));
            });
        });

        let mut states = BTreeMap::new();
        while states.len() < expected {
            match rx.recv_deadline(deadline) {
                Ok((id, outcome)) => {
                    states.insert(id, outcome);
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        let pending = expected - states.len();
        if pending > 0 {
            warn!(
                %action,
                collected = states.len(),
                pending,
                waited_ms = started.elapsed().as_millis(),
                "bulk wait budget exhausted, returning partial result"
            );
        }

        let failures: Vec<(&TriggerId, &str)> = states
            .iter()
            .filter(|(_, o)| o.state == TriggerState::Error)
            .map(|(id, o)| (id, o.error.as_deref().unwrap_or("unknown error")))
            .collect();

        let error_message = if failures.is_empty() {
            None
        } else {
            let mut msg = format!("{} of {expected} triggers failed to {action}:", failures.len());
            for (id, err) in &failures {
                let _ = write!(msg, " [{id}] {err};");
            }
            msg.pop();
            Some(msg)
        };

        info!(
            %action,
            batch = expected,
            failed = failures.len(),
            pending,
            elapsed_ms = started.elapsed().as_millis(),
            "bulk run finished"
        );

        BulkOperationResult {
            action,
            success: failures.is_empty(),
            states,
            pending,
            error_message,
        }
    }
}

impl std::fmt::Debug for BulkActivationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkActivationCoordinator")
            .field("max_wait", &self.max_wait)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}
