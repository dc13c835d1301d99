//! # stubgate - multi-protocol mock front end
//!
//! stubgate runs many concurrently active protocol listeners ("triggers"),
//! each bound to one configured endpoint. Requests received on a trigger are
//! forwarded to a remote computation backend and the synthesized response is
//! returned over the original protocol. Triggers are activated, deactivated
//! and bulk-reconciled at runtime from control events.
//!
//! ## Core Concepts
//!
//! - **Trigger**: a protocol listener with a serialized lifecycle state machine
//! - **TriggerRegistry**: the live trigger per id, at most one
//! - **BulkActivationCoordinator**: one action fanned out over a batch with
//!   per-item failure isolation and a bounded wait
//! - **SessionCorrelator**: lets a protocol thread block on an asynchronous
//!   backend response
//! - **ActivationDispatcher**: routes control events off the delivery thread
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stubgate::{Collaborators, Frontend, FrontendConfig};
//!
//! let config = FrontendConfig::load(None)?;
//! stubgate::telemetry::initialise(&config.telemetry)?;
//!
//! let frontend = Frontend::new(config, collaborators)?;
//! frontend.dispatcher().submit_raw(br#"{"type":"startup_sweep","context":{...}}"#)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Ambient
pub mod config;
pub mod error;
pub mod pool;
pub mod telemetry;

// Trigger model and lifecycle
pub mod availability;
pub mod lifecycle;
pub mod registry;
pub mod trigger;

// Coordination
pub mod backend;
pub mod bulk;
pub mod control;
pub mod dispatch;
pub mod frontend;
pub mod session;

pub use availability::AvailabilityCache;
pub use backend::{ExecutionBackend, InMemoryBackend, TriggerStateUpdate};
pub use bulk::{BulkActivationCoordinator, BulkOperationResult, ItemOutcome, OutcomeCounters};
pub use config::FrontendConfig;
pub use control::{
    ChannelStatusSink, ControlContext, ControlEvent, DispatchFailure, RecordingStatusSink, StatusMessage,
    StatusNotification, StatusSink, TargetType,
};
pub use dispatch::{ActivationDispatcher, DispatchOutcome, StartupReport};
pub use error::{
    BackendError, ConfigError, DispatchError, GatewayError, GatewayResult, ListenerError, TriggerError,
};
pub use frontend::{Collaborators, Frontend, ShutdownReport};
pub use lifecycle::{ActivationOutcome, TriggerAction, TriggerLifecycleManager};
pub use pool::ThreadPoolProvider;
pub use registry::TriggerRegistry;
pub use session::{
    BackoffPolicy, CrossbeamExecutionChannel, ExecutionChannel, ExecutionRequest, ExecutionResponse,
    FastPathResponder, SessionCorrelator, SessionId,
};
pub use trigger::{
    ConnectionProperties, EnvironmentId, ListenerFactory, ProjectId, ProtocolListener, ProtocolTrigger,
    TransportKind, TriggerFactory, TriggerHandle, TriggerId, TriggerLifecycle, TriggerSample, TriggerState,
};
