use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use stubgate::{
    Collaborators, ConnectionProperties, CrossbeamExecutionChannel, EnvironmentId, Frontend, FrontendConfig,
    InMemoryBackend, ListenerError, ListenerFactory, ProjectId, ProtocolListener, RecordingStatusSink,
    TransportKind, TriggerAction, TriggerId, TriggerSample, TriggerState,
};

struct NoopListener;

impl ProtocolListener for NoopListener {
    fn start(&self, _: &ConnectionProperties) -> Result<(), ListenerError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

fn frontend() -> Frontend {
    let (execution, _requests) = CrossbeamExecutionChannel::new(16);
    let factory = ListenerFactory::new().with_listener(TransportKind::Tcp, |_| Box::new(NoopListener));

    let mut config = FrontendConfig::default();
    config.availability.probe_enabled = false;

    Frontend::new(
        config,
        Collaborators {
            backend: Arc::new(InMemoryBackend::new()),
            factory: Arc::new(factory),
            status: Arc::new(RecordingStatusSink::new()),
            execution: Arc::new(execution),
            fast_path: None,
        },
    )
    .unwrap()
}

fn samples(n: usize) -> Vec<TriggerSample> {
    (0..n)
        .map(|i| TriggerSample {
            id: TriggerId::new(i.to_string()),
            name: format!("bench-{i}"),
            project_id: ProjectId::from("bench"),
            environment_id: EnvironmentId::from("bench"),
            properties: ConnectionProperties::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9000,
            },
            state: TriggerState::Inactive,
        })
        .collect()
}

fn bench_bulk_fanout(c: &mut Criterion) {
    let fe = frontend();
    let mut group = c.benchmark_group("bulk_fanout");

    for n in [16_usize, 256, 1024] {
        let batch = samples(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("reactivate", n), &batch, |b, batch| {
            b.iter(|| {
                let result = fe.bulk().run(TriggerAction::ReActivate, batch.clone());
                assert!(result.success);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_bulk_fanout);
criterion_main!(benches);
