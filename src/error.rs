//! Error types for stubgate.
//!
//! All errors are strongly typed using thiserror. Each concern gets its own
//! sub-enum and `GatewayError` wraps them, so callers can match on the exact
//! failure while still propagating with `?`.

use thiserror::Error;

use crate::trigger::{TransportKind, TriggerId};

/// Failure raised by a protocol listener collaborator.
///
/// Listener implementations live outside this crate (one per protocol family),
/// so the error only carries a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ListenerError {
    /// Human readable cause.
    pub message: String,
}

impl ListenerError {
    /// Creates a listener error from any displayable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors raised by trigger state transitions and construction.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Failed to activate trigger '{name}': {source}")]
    Activation {
        name: String,
        #[source]
        source: ListenerError,
    },

    #[error("Failed to deactivate trigger '{name}': {source}")]
    Deactivation {
        name: String,
        #[source]
        source: ListenerError,
    },

    #[error("No protocol listener registered for transport {kind}")]
    UnsupportedTransport { kind: TransportKind },

    #[error("Poisoned lock: {context}")]
    PoisonedLock { context: &'static str },

    #[error("Lifecycle manager is shut down; trigger {id} was not activated")]
    ShutDown { id: TriggerId },
}

/// Errors raised by the backend execution RPC collaborator.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("Trigger not found: {id}")]
    TriggerNotFound { id: TriggerId },

    #[error("Backend rejected request: {message}")]
    Rejected { message: String },
}

/// Errors raised while routing control events and requests.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Malformed control event: {reason}")]
    MalformedEvent { reason: String },

    #[error("Queue full on {path} (capacity {capacity})")]
    QueueFull { path: String, capacity: usize },

    #[error("Channel disconnected: {path}")]
    Disconnected { path: String },
}

/// Errors raised while loading configuration.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level error type for stubgate.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a trigger error.
    #[must_use]
    pub const fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger(_))
    }

    /// Returns true if this is a backend error.
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Returns true if this is a dispatch error.
    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }

    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => matches!(e, BackendError::Unavailable { .. }),
            Self::Dispatch(e) => matches!(e, DispatchError::QueueFull { .. }),
            Self::Trigger(_) | Self::Config(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for stubgate operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_error_names_trigger() {
        let err = TriggerError::Activation {
            name: "orders-http".to_string(),
            source: ListenerError::new("port 8080 in use"),
        };
        let msg = format!("{err}");
        assert!(msg.contains("orders-http"));
        assert!(msg.contains("port 8080 in use"));
    }

    #[test]
    fn test_unsupported_transport() {
        let err = TriggerError::UnsupportedTransport { kind: TransportKind::Kafka };
        assert!(format!("{err}").contains("kafka"));
    }

    #[test]
    fn test_gateway_error_from_backend() {
        let err: GatewayError = BackendError::Unavailable {
            message: "connection refused".to_string(),
        }
        .into();
        assert!(err.is_backend());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_gateway_error_from_dispatch() {
        let err: GatewayError = DispatchError::MalformedEvent {
            reason: "missing type".to_string(),
        }
        .into();
        assert!(err.is_dispatch());
        assert!(!err.is_retryable());

        let full: GatewayError = DispatchError::QueueFull {
            path: "control".to_string(),
            capacity: 4,
        }
        .into();
        assert!(full.is_retryable());
    }

    #[test]
    fn test_trigger_not_found_names_id() {
        let err: GatewayError = BackendError::TriggerNotFound { id: TriggerId::from("ghost") }.into();
        assert!(err.to_string().contains("Trigger not found: ghost"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_trigger_errors_not_retryable() {
        let err: GatewayError = TriggerError::PoisonedLock { context: "registry" }.into();
        assert!(err.is_trigger());
        assert!(!err.is_retryable());

        let closed: GatewayError = TriggerError::ShutDown { id: TriggerId::from("7") }.into();
        assert!(!closed.is_retryable());
        assert!(closed.to_string().contains("shut down"));
    }

    #[test]
    fn test_internal() {
        let err = GatewayError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
