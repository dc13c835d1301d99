#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use stubgate::{
    Collaborators, ConnectionProperties, CrossbeamExecutionChannel, EnvironmentId, ExecutionRequest, Frontend,
    FrontendConfig, InMemoryBackend, ListenerError, ListenerFactory, ProjectId, ProtocolListener,
    RecordingStatusSink, TransportKind, TriggerId, TriggerSample, TriggerState,
};

/// Shared behaviour script for every listener built by [`factory`].
#[derive(Default)]
pub struct Script {
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    pub started: Mutex<Vec<String>>,
    pub live: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_start(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn panic_on_start(&self, id: &str) {
        self.panicking.lock().unwrap().insert(id.to_string());
    }

    pub fn unreachable(&self, id: &str) {
        self.unreachable.lock().unwrap().insert(id.to_string());
    }

    pub fn delay_start(&self, id: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(id.to_string(), delay);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

struct ScriptedListener {
    id: String,
    script: Arc<Script>,
}

impl ProtocolListener for ScriptedListener {
    fn start(&self, _: &ConnectionProperties) -> Result<(), ListenerError> {
        let delay = self.script.delays.lock().unwrap().get(&self.id).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.script.panicking.lock().unwrap().contains(&self.id) {
            panic!("listener for {} exploded", self.id);
        }
        if self.script.failing.lock().unwrap().contains(&self.id) {
            return Err(ListenerError::new(format!("bind refused for {}", self.id)));
        }
        self.script.started.lock().unwrap().push(self.id.clone());
        self.script.live.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), ListenerError> {
        self.script.stops.fetch_add(1, Ordering::SeqCst);
        // Cleanup after a failed start also lands here.
        let _ = self
            .script
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }

    fn probe(&self, _: &ConnectionProperties, _: Duration) -> bool {
        !self.script.unreachable.lock().unwrap().contains(&self.id)
    }
}

pub fn factory(script: &Arc<Script>) -> ListenerFactory {
    TransportKind::ALL.iter().fold(ListenerFactory::new(), |factory, kind| {
        let script = Arc::clone(script);
        factory.with_listener(*kind, move |sample| {
            Box::new(ScriptedListener {
                id: sample.id.to_string(),
                script: Arc::clone(&script),
            })
        })
    })
}

pub fn tcp(id: &str, state: TriggerState) -> TriggerSample {
    TriggerSample {
        id: TriggerId::from(id),
        name: format!("tcp-{id}"),
        project_id: ProjectId::from("p1"),
        environment_id: EnvironmentId::from("dev"),
        properties: ConnectionProperties::Tcp {
            host: format!("tcp-{id}.local"),
            port: 7000,
        },
        state,
    }
}

pub fn mqtt(id: &str, state: TriggerState) -> TriggerSample {
    TriggerSample {
        id: TriggerId::from(id),
        name: format!("mqtt-{id}"),
        project_id: ProjectId::from("p1"),
        environment_id: EnvironmentId::from("dev"),
        properties: ConnectionProperties::Mqtt {
            host: format!("mqtt-{id}.local"),
            port: 1883,
            topic: "events".to_string(),
        },
        state,
    }
}

pub struct Harness {
    pub frontend: Frontend,
    pub backend: Arc<InMemoryBackend>,
    pub status: Arc<RecordingStatusSink>,
    pub script: Arc<Script>,
    pub requests: Receiver<ExecutionRequest>,
}

pub fn test_config() -> FrontendConfig {
    let mut config = FrontendConfig::default();
    config.pools.control_workers = 2;
    config.pools.control_queue_capacity = 16;
    config.pools.fan_out_threads = 4;
    config.bulk.max_wait_ms = 5_000;
    config.startup.tier_delay_ms = 0;
    config.startup.retry_delay_ms = 10;
    config.startup.retry_attempts = 3;
    config
}

pub fn harness(samples: Vec<TriggerSample>) -> Harness {
    harness_with(samples, test_config())
}

pub fn harness_with(samples: Vec<TriggerSample>, config: FrontendConfig) -> Harness {
    let script = Script::new();
    let backend = Arc::new(InMemoryBackend::with_samples(samples));
    let status = Arc::new(RecordingStatusSink::new());
    let (execution, requests) = CrossbeamExecutionChannel::new(64);

    let frontend = Frontend::new(
        config,
        Collaborators {
            backend: backend.clone(),
            factory: Arc::new(factory(&script)),
            status: status.clone(),
            execution: Arc::new(execution),
            fast_path: None,
        },
    )
    .unwrap();

    Harness {
        frontend,
        backend,
        status,
        script,
        requests,
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
