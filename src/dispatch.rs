//! Control event routing.
//!
//! [`ActivationDispatcher::submit`] hands every event to the bounded control
//! pool so the delivery thread never runs trigger work. Single-trigger actions
//! go straight to the lifecycle manager; environment and project actions,
//! startup sweeps and syncs go through the bulk coordinator. Exactly one outbound
//! notification is published per target, and a [`DispatchFailure`] when the
//! event could not be processed at all.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::availability::AvailabilityCache;
use crate::backend::{ExecutionBackend, TriggerStateUpdate};
use crate::bulk::{BulkActivationCoordinator, BulkOperationResult};
use crate::config::StartupConfig;
use crate::control::{ControlContext, ControlEvent, DispatchFailure, StatusNotification, StatusSink, TargetType};
use crate::error::{BackendError, DispatchError};
use crate::lifecycle::{TriggerAction, TriggerLifecycleManager};
use crate::pool::ThreadPoolProvider;
use crate::trigger::{EnvironmentId, TransportKind, TriggerId, TriggerSample, TriggerState};

/// Summary of one startup sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// Retrieval attempts made.
    pub attempts: u32,
    /// Samples retrieved from the backend.
    pub retrieved: usize,
    /// One bulk result per non-empty tier, in activation order.
    pub tiers: Vec<(Vec<TransportKind>, BulkOperationResult)>,
}

impl StartupReport {
    /// True when every tier completed without errors.
    #[must_use]
    pub fn success(&self) -> bool {
        self.tiers.iter().all(|(_, r)| r.success && r.is_complete())
    }

    /// Number of triggers that ended ACTIVE across all tiers.
    #[must_use]
    pub fn activated(&self) -> usize {
        self.tiers.iter().map(|(_, r)| r.count(TriggerState::Active)).sum()
    }
}

/// What handling one event produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Notification for a single-trigger action.
    Trigger(StatusNotification),
    /// Notification for an environment action.
    Environment(StatusNotification),
    /// Notification for a project action.
    Project(StatusNotification),
    /// Startup sweep summary.
    Startup(StartupReport),
    /// One notification per reconciled trigger.
    Sync(Vec<StatusNotification>),
    /// The event failed before any per-item processing.
    Failed(DispatchFailure),
}

/// Demultiplexes control events onto the lifecycle manager and the bulk
/// coordinator.
#[derive(Clone)]
pub struct ActivationDispatcher {
    lifecycle: Arc<TriggerLifecycleManager>,
    bulk: Arc<BulkActivationCoordinator>,
    backend: Arc<dyn ExecutionBackend>,
    status: Arc<dyn StatusSink>,
    pools: Arc<ThreadPoolProvider>,
    startup: StartupConfig,
    probe_timeout: Duration,
}

impl ActivationDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        lifecycle: Arc<TriggerLifecycleManager>,
        bulk: Arc<BulkActivationCoordinator>,
        backend: Arc<dyn ExecutionBackend>,
        status: Arc<dyn StatusSink>,
        pools: Arc<ThreadPoolProvider>,
        startup: StartupConfig,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            bulk,
            backend,
            status,
            pools,
            startup,
            probe_timeout,
        }
    }

    /// Queues `event` on the control pool.
    ///
    /// A full or closed queue is reported outward as a dispatch failure and
    /// returned to the caller.
    pub fn submit(&self, event: ControlEvent) -> Result<(), DispatchError> {
        let context = event.context().clone();
        let kind = event.kind();
        let dispatcher = self.clone();
        let submitted = self.pools.submit(move || {
            dispatcher.handle(event);
        });
        if let Err(err) = &submitted {
            warn!(kind, session = %context.session_id, error = %err, "control event rejected");
            self.status.publish_failure(DispatchFailure::for_context(&context, err.to_string()));
        } else {
            debug!(kind, session = %context.session_id, "control event queued");
        }
        submitted
    }

    /// Parses a JSON control event and queues it.
    pub fn submit_raw(&self, raw: &[u8]) -> Result<(), DispatchError> {
        let event = match serde_json::from_slice::<ControlEvent>(raw) {
            Ok(event) => event,
            Err(err) => {
                let reason = err.to_string();
                warn!(error = %reason, bytes = raw.len(), "malformed control event");
                self.status.publish_failure(DispatchFailure::for_raw(raw, reason.clone()));
                return Err(DispatchError::MalformedEvent { reason });
            }
        };
        self.submit(event)
    }

    /// Handles `event` on the calling thread and publishes its notifications.
    pub fn handle(&self, event: ControlEvent) -> DispatchOutcome {
        info!(kind = event.kind(), session = %event.context().session_id, "handling control event");
        match event {
            ControlEvent::ObjectAction {
                context,
                trigger_id,
                action,
            } => self.handle_object(&context, &trigger_id, action),
            ControlEvent::EnvironmentAction {
                context,
                environment_id,
                action,
            } => self.handle_environment(&context, &environment_id, action),
            ControlEvent::ProjectAction { context, action } => self.handle_project(&context, action),
            ControlEvent::StartupSweep { context } => self.handle_startup(&context),
            ControlEvent::Sync { context, trigger_ids } => self.handle_sync(&context, &trigger_ids),
        }
    }

    fn fail(&self, context: &ControlContext, reason: String) -> DispatchOutcome {
        let failure = DispatchFailure::for_context(context, reason);
        self.status.publish_failure(failure.clone());
        DispatchOutcome::Failed(failure)
    }

    fn handle_object(&self, context: &ControlContext, id: &TriggerId, action: TriggerAction) -> DispatchOutcome {
        let sample = match self.backend.fetch_trigger(id) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                warn!(trigger = %id, %action, "trigger not known to backend");
                return self.fail(context, BackendError::TriggerNotFound { id: id.clone() }.to_string());
            }
            Err(err) => {
                error!(trigger = %id, %action, error = %err, "trigger fetch failed");
                return self.fail(context, err.to_string());
            }
        };

        let cache = AvailabilityCache::new(self.probe_timeout);
        let (state, error) = match self.lifecycle.apply(action, &sample, &cache) {
            Ok(state) => (state, None),
            Err(err) => {
                error!(trigger = %id, %action, error = %err, "trigger action failed");
                (TriggerState::Error, Some(err.to_string()))
            }
        };

        let update = TriggerStateUpdate {
            trigger_id: sample.id.clone(),
            project_id: sample.project_id.clone(),
            state,
            error: error.clone(),
            at: Utc::now(),
        };
        if let Err(err) = self.backend.push_trigger_state(&update) {
            warn!(trigger = %id, %state, error = %err, "state push failed");
        }

        let notification = notification(context, TargetType::Trigger, id.to_string(), Some(state), error);
        self.status.publish_status(notification.clone());
        DispatchOutcome::Trigger(notification)
    }

    fn handle_environment(
        &self,
        context: &ControlContext,
        environment_id: &EnvironmentId,
        action: TriggerAction,
    ) -> DispatchOutcome {
        let fetched = self.backend.fetch_environment_triggers(&context.project_id, environment_id);
        self.run_scope(
            context,
            TargetType::Environment,
            environment_id.to_string(),
            action,
            fetched,
            DispatchOutcome::Environment,
        )
    }

    fn handle_project(&self, context: &ControlContext, action: TriggerAction) -> DispatchOutcome {
        let fetched = self.backend.fetch_project_triggers(&context.project_id);
        self.run_scope(
            context,
            TargetType::Project,
            context.project_id.to_string(),
            action,
            fetched,
            DispatchOutcome::Project,
        )
    }

    /// Bulk-applies `action` to a fetched scope and publishes one notification
    /// for it. A failed fetch is reported as a dispatch failure instead.
    fn run_scope(
        &self,
        context: &ControlContext,
        target_type: TargetType,
        target_id: String,
        action: TriggerAction,
        fetched: Result<Vec<TriggerSample>, BackendError>,
        outcome: fn(StatusNotification) -> DispatchOutcome,
    ) -> DispatchOutcome {
        let samples = match fetched {
            Ok(samples) => samples,
            Err(err) => {
                error!(scope = %target_id, ?target_type, %action, error = %err, "scope fetch failed");
                return self.fail(context, err.to_string());
            }
        };
        if samples.is_empty() {
            info!(scope = %target_id, ?target_type, %action, "scope has no triggers");
        }

        let result = self.bulk.run(action, samples);
        let mut notification = notification(context, target_type, target_id, None, result.error_message.clone());
        notification.item_states = result.state_map();
        self.status.publish_status(notification.clone());
        outcome(notification)
    }

    fn handle_startup(&self, context: &ControlContext) -> DispatchOutcome {
        let attempts = self.startup.retry_attempts.max(1);
        let retry_delay = Duration::from_millis(self.startup.retry_delay_ms);

        let mut made = 0;
        let samples = loop {
            made += 1;
            match self.backend.fetch_active_triggers() {
                Ok(samples) => break samples,
                Err(err) if made < attempts => {
                    warn!(attempt = made, attempts, error = %err, "active trigger fetch failed, retrying");
                    thread::sleep(retry_delay);
                }
                Err(err) => {
                    error!(attempts, error = %err, "active trigger fetch failed, giving up");
                    return self.fail(context, format!("startup sweep aborted after {attempts} attempts: {err}"));
                }
            }
        };

        let mut report = StartupReport {
            attempts: made,
            retrieved: samples.len(),
            tiers: Vec::new(),
        };
        if samples.is_empty() {
            info!("no active triggers, startup sweep has nothing to do");
            return DispatchOutcome::Startup(report);
        }

        let tier_timeout = Duration::from_millis(self.startup.tier_timeout_ms);
        let tier_delay = Duration::from_millis(self.startup.tier_delay_ms);
        for (kinds, batch) in split_into_tiers(&self.startup.tiers, samples) {
            if !report.tiers.is_empty() {
                thread::sleep(tier_delay);
            }
            info!(tier = report.tiers.len(), kinds = ?kinds, batch = batch.len(), "activating startup tier");
            let result = self.bulk.run_with_timeout(TriggerAction::Activate, batch, tier_timeout);
            report.tiers.push((kinds, result));
        }

        info!(
            retrieved = report.retrieved,
            activated = report.activated(),
            tiers = report.tiers.len(),
            "startup sweep finished"
        );
        DispatchOutcome::Startup(report)
    }

    fn handle_sync(&self, context: &ControlContext, ids: &[TriggerId]) -> DispatchOutcome {
        let mut to_sync = Vec::new();
        let mut to_stop = Vec::new();
        for id in ids {
            match self.backend.fetch_trigger(id) {
                Ok(Some(sample)) if sample.state == TriggerState::Active => to_sync.push(sample),
                Ok(Some(sample)) => to_stop.push(sample),
                Ok(None) => warn!(trigger = %id, "sync requested for unknown trigger"),
                Err(err) => warn!(trigger = %id, error = %err, "sync fetch failed, trigger skipped"),
            }
        }

        let mut result = self.bulk.run(TriggerAction::Sync, to_sync);
        result.merge(self.bulk.run(TriggerAction::Deactivate, to_stop));

        let notifications: Vec<_> = result
            .states
            .into_iter()
            .map(|(id, outcome)| {
                let n = notification(context, TargetType::Trigger, id.to_string(), Some(outcome.state), outcome.error);
                self.status.publish_status(n.clone());
                n
            })
            .collect();
        DispatchOutcome::Sync(notifications)
    }
}

impl std::fmt::Debug for ActivationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationDispatcher")
            .field("startup", &self.startup)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

fn notification(
    context: &ControlContext,
    target_type: TargetType,
    target_id: String,
    state: Option<TriggerState>,
    error: Option<String>,
) -> StatusNotification {
    StatusNotification {
        target_type,
        target_id,
        state,
        success: error.is_none(),
        error,
        item_states: BTreeMap::new(),
        user: context.user.clone(),
        session_id: context.session_id.clone(),
        project_id: context.project_id.clone(),
        at: Utc::now(),
    }
}

/// Groups `samples` by the configured protocol tiers.
///
/// Transports not named by any tier form one trailing tier. Empty tiers are
/// dropped.
fn split_into_tiers(
    tiers: &[Vec<TransportKind>],
    samples: Vec<TriggerSample>,
) -> Vec<(Vec<TransportKind>, Vec<TriggerSample>)> {
    let mut remaining = samples;
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(tiers.len() + 1);

    for tier in tiers {
        seen.extend(tier.iter().copied());
        let (batch, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|s| tier.contains(&s.transport()));
        remaining = rest;
        if !batch.is_empty() {
            out.push((tier.clone(), batch));
        }
    }

    if !remaining.is_empty() {
        let mut leftover: Vec<TransportKind> = TransportKind::ALL
            .iter()
            .copied()
            .filter(|k| !seen.contains(k))
            .collect();
        leftover.sort();
        out.push((leftover, remaining));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::trigger::{ConnectionProperties, EnvironmentId, ProjectId};

    fn sample(id: &str, properties: ConnectionProperties) -> TriggerSample {
        TriggerSample {
            id: TriggerId::from(id),
            name: id.to_string(),
            project_id: ProjectId::from("p"),
            environment_id: EnvironmentId::from("e"),
            properties,
            state: TriggerState::Active,
        }
    }

    fn tcp(id: &str) -> TriggerSample {
        sample(
            id,
            ConnectionProperties::Tcp {
                host: "h".to_string(),
                port: 1,
            },
        )
    }

    fn mqtt(id: &str) -> TriggerSample {
        sample(
            id,
            ConnectionProperties::Mqtt {
                host: "h".to_string(),
                port: 1883,
                topic: "t".to_string(),
            },
        )
    }

    fn kafka(id: &str) -> TriggerSample {
        sample(
            id,
            ConnectionProperties::Kafka {
                bootstrap_servers: "b:9092".to_string(),
                topic: "t".to_string(),
                group_id: None,
            },
        )
    }

    #[test]
    fn tiers_follow_configured_order() {
        let tiers = vec![vec![TransportKind::Tcp], vec![TransportKind::Mqtt]];
        let split = split_into_tiers(&tiers, vec![mqtt("m"), tcp("t1"), tcp("t2")]);

        assert_eq!(split.len(), 2);
        assert_eq!(split[0].0, vec![TransportKind::Tcp]);
        assert_eq!(split[0].1.len(), 2);
        assert_eq!(split[1].0, vec![TransportKind::Mqtt]);
    }

    #[test]
    fn unlisted_transports_form_trailing_tier() {
        let tiers = vec![vec![TransportKind::Tcp]];
        let split = split_into_tiers(&tiers, vec![kafka("k"), tcp("t")]);

        assert_eq!(split.len(), 2);
        assert_eq!(split[1].1[0].id, TriggerId::from("k"));
        assert!(split[1].0.contains(&TransportKind::Kafka));
        assert!(!split[1].0.contains(&TransportKind::Tcp));
    }

    #[test]
    fn empty_tiers_are_dropped() {
        let tiers = vec![vec![TransportKind::Http], vec![TransportKind::Tcp]];
        let split = split_into_tiers(&tiers, vec![tcp("t")]);
        assert_eq!(split.len(), 1);
        assert_eq!(split[0].0, vec![TransportKind::Tcp]);
    }

    #[test]
    fn notification_success_tracks_error() {
        let context = ControlContext {
            session_id: "s".to_string(),
            project_id: ProjectId::from("p"),
            user: "u".to_string(),
        };
        let ok = notification(&context, TargetType::Trigger, "1".to_string(), Some(TriggerState::Active), None);
        assert!(ok.success);
        let failed = notification(
            &context,
            TargetType::Trigger,
            "1".to_string(),
            Some(TriggerState::Error),
            Some("boom".to_string()),
        );
        assert!(!failed.success);
        assert_eq!(failed.user, "u");
    }
}
