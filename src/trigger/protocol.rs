//! Protocol listeners and the live trigger built on top of them.
//!
//! A [`ProtocolListener`] is the per-protocol collaborator that binds and
//! releases the actual endpoint. [`ProtocolTrigger`] pairs one listener with a
//! [`TransitionCell`] and is what the registry holds, behind the
//! [`TriggerLifecycle`] trait. [`ListenerFactory`] picks the listener builder
//! by [`TransportKind`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::availability::AvailabilityCache;
use crate::error::{ListenerError, TriggerError};

use super::state::TransitionCell;
use super::{ConnectionProperties, TransportKind, TriggerId, TriggerSample, TriggerState};

/// Protocol-specific resource owner (codec, socket, consumer).
///
/// Implementations live with the wire codecs, one per protocol family. They
/// are only ever called under the owning trigger's transition lock.
pub trait ProtocolListener: Send + Sync {
    /// Acquires protocol resources and starts serving `properties`.
    fn start(&self, properties: &ConnectionProperties) -> Result<(), ListenerError>;

    /// Releases protocol resources.
    fn stop(&self) -> Result<(), ListenerError>;

    /// Pre-flight reachability check. Defaults to reachable.
    fn probe(&self, _properties: &ConnectionProperties, _timeout: Duration) -> bool {
        true
    }
}

/// Lifecycle contract shared by every trigger variant.
pub trait TriggerLifecycle: Send + Sync {
    /// Trigger id.
    fn id(&self) -> &TriggerId;

    /// Descriptive name.
    fn name(&self) -> &str;

    /// Protocol family of the current configuration.
    fn transport(&self) -> TransportKind;

    /// Current visible state.
    fn state(&self) -> TriggerState;

    /// INACTIVE/ERROR -> STARTING -> ACTIVE (or ERROR).
    fn activate(&self) -> Result<(), TriggerError>;

    /// ACTIVE/ERROR -> SHUTTING_DOWN -> INACTIVE (or ERROR).
    fn deactivate(&self) -> Result<(), TriggerError>;

    /// Replaces the connection properties, restarting the listener if it is on.
    fn apply_configuration(&self, properties: ConnectionProperties) -> Result<(), TriggerError>;

    /// Pre-flight probe, memoized in `cache` for the current bulk run.
    fn check_if_server_available(&self, _cache: &AvailabilityCache) -> bool {
        true
    }
}

/// A live trigger instance registered under its id.
pub type TriggerHandle = Arc<dyn TriggerLifecycle>;

/// Trigger variant composed from a protocol listener and a [`TransitionCell`].
pub struct ProtocolTrigger {
    id: TriggerId,
    name: String,
    properties: RwLock<ConnectionProperties>,
    listener: Box<dyn ProtocolListener>,
    cell: TransitionCell,
}

impl ProtocolTrigger {
    /// Builds an inactive trigger for `sample` backed by `listener`.
    #[must_use]
    pub fn new(sample: &TriggerSample, listener: Box<dyn ProtocolListener>) -> Self {
        Self {
            id: sample.id.clone(),
            name: sample.name.clone(),
            properties: RwLock::new(sample.properties.clone()),
            listener,
            cell: TransitionCell::new(),
        }
    }

    fn properties(&self) -> ConnectionProperties {
        self.properties.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn descriptive_name(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }
}

impl fmt::Debug for ProtocolTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolTrigger")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.cell.state())
            .finish_non_exhaustive()
    }
}

impl TriggerLifecycle for ProtocolTrigger {
    fn id(&self) -> &TriggerId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> TransportKind {
        self.properties.read().unwrap_or_else(PoisonError::into_inner).kind()
    }

    fn state(&self) -> TriggerState {
        self.cell.state()
    }

    fn activate(&self) -> Result<(), TriggerError> {
        let props = self.properties();
        self.cell.lock()?.activate(
            &self.descriptive_name(),
            || self.listener.start(&props),
            || self.listener.stop(),
        )
    }

    fn deactivate(&self) -> Result<(), TriggerError> {
        self.cell
            .lock()?
            .deactivate(&self.descriptive_name(), || self.listener.stop())
    }

    fn apply_configuration(&self, properties: ConnectionProperties) -> Result<(), TriggerError> {
        let name = self.descriptive_name();
        let transition = self.cell.lock()?;
        let restart = transition.state().is_on();

        if restart {
            transition.deactivate(&name, || self.listener.stop())?;
        }
        *self.properties.write().unwrap_or_else(PoisonError::into_inner) = properties.clone();
        debug!(trigger = %self.id, restart, "configuration replaced");

        if restart {
            transition.activate(&name, || self.listener.start(&properties), || self.listener.stop())?;
        }
        Ok(())
    }

    fn check_if_server_available(&self, cache: &AvailabilityCache) -> bool {
        let props = self.properties();
        let key = props.availability_key();
        cache.get_or_probe(&key, |timeout| self.listener.probe(&props, timeout))
    }
}

/// Constructs protocol-specific trigger instances from samples.
pub trait TriggerFactory: Send + Sync {
    /// Creates an inactive instance for `sample`.
    fn create(&self, sample: &TriggerSample) -> Result<TriggerHandle, TriggerError>;
}

/// Builds a listener for one protocol family.
pub type ListenerBuilder = Box<dyn Fn(&TriggerSample) -> Box<dyn ProtocolListener> + Send + Sync>;

/// [`TriggerFactory`] keyed by transport type.
#[derive(Default)]
pub struct ListenerFactory {
    builders: HashMap<TransportKind, ListenerBuilder>,
}

impl ListenerFactory {
    /// Creates a factory with no registered protocol families.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the listener builder for `kind`, replacing any previous one.
    #[must_use]
    pub fn with_listener<F>(mut self, kind: TransportKind, builder: F) -> Self
    where
        F: Fn(&TriggerSample) -> Box<dyn ProtocolListener> + Send + Sync + 'static,
    {
        self.builders.insert(kind, Box::new(builder));
        self
    }

    /// Returns true if `kind` has a registered builder.
    #[must_use]
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.builders.contains_key(&kind)
    }
}

impl fmt::Debug for ListenerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.builders.keys().copied().collect();
        kinds.sort();
        f.debug_struct("ListenerFactory").field("kinds", &kinds).finish()
    }
}

impl TriggerFactory for ListenerFactory {
    fn create(&self, sample: &TriggerSample) -> Result<TriggerHandle, TriggerError> {
        let kind = sample.transport();
        let builder = self
            .builders
            .get(&kind)
            .ok_or(TriggerError::UnsupportedTransport { kind })?;
        Ok(Arc::new(ProtocolTrigger::new(sample, builder(sample))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::trigger::{EnvironmentId, ProjectId};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        probes: AtomicUsize,
    }

    struct RecordingListener(Arc<Recorder>);

    impl ProtocolListener for RecordingListener {
        fn start(&self, properties: &ConnectionProperties) -> Result<(), ListenerError> {
            let port = properties.endpoint().map_or(0, |(_, p)| p);
            self.0.events.lock().unwrap().push(format!("start:{port}"));
            Ok(())
        }

        fn stop(&self) -> Result<(), ListenerError> {
            self.0.events.lock().unwrap().push("stop".to_string());
            Ok(())
        }

        fn probe(&self, _properties: &ConnectionProperties, _timeout: Duration) -> bool {
            self.0.probes.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn http_sample(port: u16) -> TriggerSample {
        TriggerSample {
            id: TriggerId::from("t1"),
            name: "orders".to_string(),
            project_id: ProjectId::from("p1"),
            environment_id: EnvironmentId::from("dev"),
            properties: ConnectionProperties::Http {
                host: "127.0.0.1".to_string(),
                port,
                base_path: String::new(),
            },
            state: TriggerState::Inactive,
        }
    }

    #[test]
    fn apply_configuration_restarts_active_trigger() {
        let rec = Arc::new(Recorder::default());
        let trigger = ProtocolTrigger::new(&http_sample(8080), Box::new(RecordingListener(Arc::clone(&rec))));
        trigger.activate().unwrap();
        trigger.apply_configuration(http_sample(9090).properties).unwrap();

        assert_eq!(trigger.state(), TriggerState::Active);
        assert_eq!(*rec.events.lock().unwrap(), vec!["start:8080", "stop", "start:9090"]);
    }

    #[test]
    fn apply_configuration_on_inactive_only_replaces() {
        let rec = Arc::new(Recorder::default());
        let trigger = ProtocolTrigger::new(&http_sample(8080), Box::new(RecordingListener(Arc::clone(&rec))));
        trigger.apply_configuration(http_sample(9090).properties).unwrap();

        assert_eq!(trigger.state(), TriggerState::Inactive);
        assert!(rec.events.lock().unwrap().is_empty());

        trigger.activate().unwrap();
        assert_eq!(*rec.events.lock().unwrap(), vec!["start:9090"]);
    }

    #[test]
    fn availability_probe_is_memoized_per_cache() {
        let rec = Arc::new(Recorder::default());
        let a = ProtocolTrigger::new(&http_sample(8080), Box::new(RecordingListener(Arc::clone(&rec))));
        let b = ProtocolTrigger::new(&http_sample(8080), Box::new(RecordingListener(Arc::clone(&rec))));
        let cache = AvailabilityCache::new(Duration::from_millis(10));

        assert!(!a.check_if_server_available(&cache));
        assert!(!b.check_if_server_available(&cache));
        assert_eq!(rec.probes.load(Ordering::SeqCst), 1);

        let fresh = AvailabilityCache::new(Duration::from_millis(10));
        assert!(!a.check_if_server_available(&fresh));
        assert_eq!(rec.probes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn factory_rejects_unregistered_transport() {
        let factory = ListenerFactory::new()
            .with_listener(TransportKind::Tcp, |_| Box::new(RecordingListener(Arc::default())));
        assert!(factory.supports(TransportKind::Tcp));

        let err = factory.create(&http_sample(8080)).err().unwrap();
        assert!(matches!(err, TriggerError::UnsupportedTransport { kind: TransportKind::Http }));
    }

    #[test]
    fn activation_error_carries_descriptive_name() {
        struct Failing;
        impl ProtocolListener for Failing {
            fn start(&self, _: &ConnectionProperties) -> Result<(), ListenerError> {
                Err(ListenerError::new("address in use"))
            }
            fn stop(&self) -> Result<(), ListenerError> {
                Ok(())
            }
        }

        let trigger = ProtocolTrigger::new(&http_sample(8080), Box::new(Failing));
        let msg = trigger.activate().unwrap_err().to_string();
        assert!(msg.contains("orders (t1)"));
        assert!(msg.contains("address in use"));
        assert_eq!(trigger.state(), TriggerState::Error);
    }
}
