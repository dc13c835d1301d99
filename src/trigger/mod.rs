//! Trigger identity, state and configuration snapshots.
//!
//! A trigger is a live listener bound to one externally configured protocol
//! endpoint. The authoritative configuration lives in the backend; this crate
//! only sees immutable [`TriggerSample`] snapshots and turns them into live
//! [`TriggerHandle`]s.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod protocol;
pub mod state;

pub use protocol::{
    ListenerBuilder, ListenerFactory, ProtocolListener, ProtocolTrigger, TriggerFactory, TriggerHandle,
    TriggerLifecycle,
};
pub use state::{Transition, TransitionCell};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an externally assigned identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

opaque_id!(
    /// Externally assigned, opaque trigger identifier. Unique per endpoint.
    TriggerId
);
opaque_id!(
    /// Owning project (tenant) identifier.
    ProjectId
);
opaque_id!(
    /// Environment identifier; the unit of environment-wide bulk actions.
    EnvironmentId
);

/// Lifecycle state of a trigger.
///
/// There is no terminal state: `Error` can be left through either
/// activation or deactivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Not listening. No handle is registered.
    #[default]
    Inactive,
    /// Activation in progress.
    Starting,
    /// Listening.
    Active,
    /// Deactivation in progress.
    ShuttingDown,
    /// Last transition failed.
    Error,
}

impl TriggerState {
    /// Returns true for states in which the listener holds (or is acquiring)
    /// protocol resources.
    #[must_use]
    pub const fn is_on(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "INACTIVE",
            Self::Starting => "STARTING",
            Self::Active => "ACTIVE",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Protocol family of a trigger.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Tcp,
    Grpc,
    Kafka,
    Amqp,
    Mqtt,
}

impl TransportKind {
    /// Every supported protocol family.
    pub const ALL: [Self; 6] = [Self::Http, Self::Tcp, Self::Grpc, Self::Kafka, Self::Amqp, Self::Mqtt];

    /// Lower-case protocol name, as used in availability keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Grpc => "grpc",
            Self::Kafka => "kafka",
            Self::Amqp => "amqp",
            Self::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection properties, one payload per protocol family.
///
/// Server-style families (`Http`, `Tcp`, `Grpc`) describe the local bind
/// address. Broker-style families (`Kafka`, `Amqp`, `Mqtt`) describe the
/// remote broker the listener consumes from.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ConnectionProperties {
    Http {
        host: String,
        port: u16,
        #[serde(default)]
        base_path: String,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Grpc {
        host: String,
        port: u16,
        #[serde(default)]
        service: String,
    },
    Kafka {
        /// Comma separated `host:port` list.
        bootstrap_servers: String,
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
    },
    Amqp {
        host: String,
        port: u16,
        queue: String,
    },
    Mqtt {
        host: String,
        port: u16,
        topic: String,
    },
}

impl ConnectionProperties {
    /// Protocol family of this payload.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Http { .. } => TransportKind::Http,
            Self::Tcp { .. } => TransportKind::Tcp,
            Self::Grpc { .. } => TransportKind::Grpc,
            Self::Kafka { .. } => TransportKind::Kafka,
            Self::Amqp { .. } => TransportKind::Amqp,
            Self::Mqtt { .. } => TransportKind::Mqtt,
        }
    }

    /// Primary `(host, port)` endpoint, if one can be derived.
    ///
    /// For Kafka the first bootstrap server is used.
    #[must_use]
    pub fn endpoint(&self) -> Option<(String, u16)> {
        match self {
            Self::Http { host, port, .. }
            | Self::Tcp { host, port }
            | Self::Grpc { host, port, .. }
            | Self::Amqp { host, port, .. }
            | Self::Mqtt { host, port, .. } => Some((host.clone(), *port)),
            Self::Kafka { bootstrap_servers, .. } => {
                let first = bootstrap_servers.split(',').map(str::trim).find(|s| !s.is_empty())?;
                let (host, port) = first.rsplit_once(':')?;
                Some((host.to_string(), port.parse().ok()?))
            }
        }
    }

    /// Key used to memoize reachability probes: `host:port+protocol`.
    #[must_use]
    pub fn availability_key(&self) -> String {
        match self.endpoint() {
            Some((host, port)) => format!("{host}:{port}+{}", self.kind()),
            None => format!("unknown+{}", self.kind()),
        }
    }
}

/// Immutable snapshot of a trigger's configuration and last known state,
/// as fetched from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSample {
    /// Trigger id.
    pub id: TriggerId,
    /// Descriptive name, used in error messages and logs.
    pub name: String,
    /// Owning project.
    pub project_id: ProjectId,
    /// Environment the trigger belongs to.
    pub environment_id: EnvironmentId,
    /// Protocol family and connection payload.
    pub properties: ConnectionProperties,
    /// Last state recorded by the backend.
    #[serde(default)]
    pub state: TriggerState,
}

impl TriggerSample {
    /// Protocol family of this trigger.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.properties.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_endpoint_uses_first_bootstrap_server() {
        let props = ConnectionProperties::Kafka {
            bootstrap_servers: " broker-1:9092, broker-2:9092".to_string(),
            topic: "orders".to_string(),
            group_id: None,
        };
        assert_eq!(props.endpoint(), Some(("broker-1".to_string(), 9092)));
        assert_eq!(props.availability_key(), "broker-1:9092+kafka");
    }

    #[test]
    fn malformed_bootstrap_has_no_endpoint() {
        let props = ConnectionProperties::Kafka {
            bootstrap_servers: "broker-without-port".to_string(),
            topic: "orders".to_string(),
            group_id: None,
        };
        assert_eq!(props.endpoint(), None);
        assert_eq!(props.availability_key(), "unknown+kafka");
    }

    #[test]
    fn sample_deserializes_from_backend_json() {
        let json = serde_json::json!({
            "id": "42",
            "name": "orders-http",
            "project_id": "p1",
            "environment_id": "dev",
            "properties": { "transport": "http", "host": "0.0.0.0", "port": 8080 },
            "state": "ACTIVE"
        });
        let sample: TriggerSample = serde_json::from_value(json).unwrap();
        assert_eq!(sample.id, TriggerId::from("42"));
        assert_eq!(sample.transport(), TransportKind::Http);
        assert_eq!(sample.state, TriggerState::Active);
    }

    #[test]
    fn state_defaults_to_inactive() {
        assert_eq!(TriggerState::default(), TriggerState::Inactive);
        assert!(TriggerState::Starting.is_on());
        assert!(!TriggerState::Error.is_on());
        assert_eq!(TriggerState::ShuttingDown.to_string(), "SHUTTING_DOWN");
    }
}
