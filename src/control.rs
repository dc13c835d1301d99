//! Control-plane message types and the outbound status channel.
//!
//! Inbound control events arrive as JSON (`{"type": "object_action", ...}`).
//! Outbound, one [`StatusNotification`] is published per completed action and
//! a [`DispatchFailure`] when an event could not be processed at all.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lifecycle::TriggerAction;
use crate::trigger::{EnvironmentId, ProjectId, TriggerId, TriggerState};

/// Correlation fields carried by every control event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlContext {
    /// Correlation id of the originating control-plane session.
    pub session_id: String,
    /// Project (tenant) the event applies to.
    pub project_id: ProjectId,
    /// Originating user.
    pub user: String,
}

/// Inbound control event.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Apply an action to one trigger.
    ObjectAction {
        context: ControlContext,
        trigger_id: TriggerId,
        action: TriggerAction,
    },

    /// Apply an action to every trigger of an environment.
    EnvironmentAction {
        context: ControlContext,
        environment_id: EnvironmentId,
        action: TriggerAction,
    },

    /// Apply an action to every trigger of the context's project.
    ProjectAction {
        context: ControlContext,
        action: TriggerAction,
    },

    /// Activate every trigger that should be live, tier by tier.
    StartupSweep { context: ControlContext },

    /// Another instance changed these triggers; reconcile locally.
    Sync {
        context: ControlContext,
        trigger_ids: Vec<TriggerId>,
    },
}

impl ControlEvent {
    /// Correlation fields of this event.
    #[must_use]
    pub const fn context(&self) -> &ControlContext {
        match self {
            Self::ObjectAction { context, .. }
            | Self::EnvironmentAction { context, .. }
            | Self::ProjectAction { context, .. }
            | Self::StartupSweep { context }
            | Self::Sync { context, .. } => context,
        }
    }

    /// Short event kind for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ObjectAction { .. } => "object_action",
            Self::EnvironmentAction { .. } => "environment_action",
            Self::ProjectAction { .. } => "project_action",
            Self::StartupSweep { .. } => "startup_sweep",
            Self::Sync { .. } => "sync",
        }
    }
}

/// What a status notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// A single trigger.
    Trigger,
    /// A whole environment.
    Environment,
    /// Every trigger of a project.
    Project,
}

/// Outbound notification for one completed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotification {
    /// Target kind.
    pub target_type: TargetType,
    /// Trigger, environment or project id.
    pub target_id: String,
    /// New state for a trigger target; absent for bulk targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TriggerState>,
    /// Aggregate success.
    pub success: bool,
    /// Shared error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-trigger states for bulk targets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub item_states: BTreeMap<TriggerId, TriggerState>,
    /// Originating user.
    pub user: String,
    /// Originating control session.
    pub session_id: String,
    /// Owning project.
    pub project_id: ProjectId,
    /// Publication time.
    pub at: DateTime<Utc>,
}

/// Outbound notification for an event that failed before per-item processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFailure {
    /// Originating control session, if it could be recovered.
    pub session_id: Option<String>,
    /// Owning project, if it could be recovered.
    pub project_id: Option<ProjectId>,
    /// Originating user, if it could be recovered.
    pub user: Option<String>,
    /// Failure description.
    pub reason: String,
    /// Publication time.
    pub at: DateTime<Utc>,
}

impl DispatchFailure {
    /// Failure carrying the full correlation context of `context`.
    #[must_use]
    pub fn for_context(context: &ControlContext, reason: impl Into<String>) -> Self {
        Self {
            session_id: Some(context.session_id.clone()),
            project_id: Some(context.project_id.clone()),
            user: Some(context.user.clone()),
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    /// Failure for a raw message that did not parse, recovering whichever
    /// correlation fields are present in `raw`.
    #[must_use]
    pub fn for_raw(raw: &[u8], reason: impl Into<String>) -> Self {
        let value: Option<serde_json::Value> = serde_json::from_slice(raw).ok();
        let field = |name: &str| {
            value
                .as_ref()
                .and_then(|v| v.get("context"))
                .and_then(|c| c.get(name))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        Self {
            session_id: field("session_id"),
            project_id: field("project_id").map(ProjectId::from),
            user: field("user"),
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Outbound status channel.
///
/// Publishing is best-effort: implementations log and drop on failure rather
/// than returning an error to the coordinator.
pub trait StatusSink: Send + Sync {
    /// Publishes a completed-action notification.
    fn publish_status(&self, notification: StatusNotification);

    /// Publishes a dispatch failure.
    fn publish_failure(&self, failure: DispatchFailure);
}

/// Message carried by [`ChannelStatusSink`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    Status(StatusNotification),
    Failure(DispatchFailure),
}

/// [`StatusSink`] forwarding onto a crossbeam channel; never blocks.
#[derive(Debug, Clone)]
pub struct ChannelStatusSink {
    tx: Sender<StatusMessage>,
}

impl ChannelStatusSink {
    /// Wraps the sending half of a status channel.
    #[must_use]
    pub const fn new(tx: Sender<StatusMessage>) -> Self {
        Self { tx }
    }

    fn forward(&self, message: StatusMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("status channel full, notification dropped"),
            Err(TrySendError::Disconnected(_)) => warn!("status channel disconnected, notification dropped"),
        }
    }
}

impl StatusSink for ChannelStatusSink {
    fn publish_status(&self, notification: StatusNotification) {
        self.forward(StatusMessage::Status(notification));
    }

    fn publish_failure(&self, failure: DispatchFailure) {
        self.forward(StatusMessage::Failure(failure));
    }
}

/// [`StatusSink`] that keeps everything it receives. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    statuses: Mutex<Vec<StatusNotification>>,
    failures: Mutex<Vec<DispatchFailure>>,
}

impl RecordingStatusSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far.
    #[must_use]
    pub fn statuses(&self) -> Vec<StatusNotification> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Failures received so far.
    #[must_use]
    pub fn failures(&self) -> Vec<DispatchFailure> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl StatusSink for RecordingStatusSink {
    fn publish_status(&self, notification: StatusNotification) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }

    fn publish_failure(&self, failure: DispatchFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_channel::bounded;

    #[test]
    fn object_action_parses_from_json() {
        let raw = br#"{
            "type": "object_action",
            "context": { "session_id": "s-1", "project_id": "p1", "user": "alice" },
            "trigger_id": "42",
            "action": "RE_ACTIVATE"
        }"#;
        let event: ControlEvent = serde_json::from_slice(raw).unwrap();
        assert_eq!(event.kind(), "object_action");
        assert_eq!(event.context().user, "alice");
        let ControlEvent::ObjectAction { trigger_id, action, .. } = event else {
            panic!("expected object action");
        };
        assert_eq!(trigger_id, TriggerId::from("42"));
        assert_eq!(action, TriggerAction::ReActivate);
    }

    #[test]
    fn failure_recovers_context_from_partial_json() {
        let raw = br#"{ "type": "bogus", "context": { "session_id": "s-9", "project_id": "p2" } }"#;
        let failure = DispatchFailure::for_raw(raw, "unknown variant");
        assert_eq!(failure.session_id.as_deref(), Some("s-9"));
        assert_eq!(failure.project_id, Some(ProjectId::from("p2")));
        assert_eq!(failure.user, None);
    }

    #[test]
    fn failure_from_garbage_has_no_context() {
        let failure = DispatchFailure::for_raw(b"\x00not json", "parse error");
        assert!(failure.session_id.is_none());
        assert!(failure.project_id.is_none());
        assert_eq!(failure.reason, "parse error");
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (tx, rx) = bounded(1);
        let sink = ChannelStatusSink::new(tx);
        let context = ControlContext {
            session_id: "s".to_string(),
            project_id: ProjectId::from("p"),
            user: "u".to_string(),
        };
        sink.publish_failure(DispatchFailure::for_context(&context, "first"));
        sink.publish_failure(DispatchFailure::for_context(&context, "second"));

        assert_eq!(rx.len(), 1);
        let StatusMessage::Failure(f) = rx.recv().unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(f.reason, "first");
    }
}
