//! Composition root.
//!
//! [`Frontend`] owns every process-scoped service: the pools, the registry,
//! the lifecycle manager, the bulk coordinator, the session correlator and
//! the dispatcher. External collaborators are injected through
//! [`Collaborators`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::ExecutionBackend;
use crate::bulk::BulkActivationCoordinator;
use crate::config::FrontendConfig;
use crate::control::StatusSink;
use crate::dispatch::ActivationDispatcher;
use crate::error::GatewayResult;
use crate::lifecycle::TriggerLifecycleManager;
use crate::pool::ThreadPoolProvider;
use crate::registry::TriggerRegistry;
use crate::session::{BackoffPolicy, ExecutionChannel, FastPathResponder, SessionCorrelator};
use crate::trigger::TriggerFactory;

/// External collaborators the front end is wired to.
#[derive(Clone)]
pub struct Collaborators {
    /// Backend owning authoritative trigger configuration.
    pub backend: Arc<dyn ExecutionBackend>,
    /// Builds protocol-specific trigger instances.
    pub factory: Arc<dyn TriggerFactory>,
    /// Outbound status channel.
    pub status: Arc<dyn StatusSink>,
    /// Outbound execution channel for protocol requests.
    pub execution: Arc<dyn ExecutionChannel>,
    /// Optional local responder consulted before the backend.
    pub fast_path: Option<Arc<dyn FastPathResponder>>,
}

/// Shutdown summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Triggers deactivated by the registry sweep.
    pub triggers_stopped: usize,
    /// Session waiters released.
    pub sessions_interrupted: usize,
}

/// A fully wired front end.
pub struct Frontend {
    config: FrontendConfig,
    pools: Arc<ThreadPoolProvider>,
    registry: Arc<TriggerRegistry>,
    lifecycle: Arc<TriggerLifecycleManager>,
    bulk: Arc<BulkActivationCoordinator>,
    sessions: Arc<SessionCorrelator>,
    dispatcher: ActivationDispatcher,
    shut_down: AtomicBool,
}

impl Frontend {
    /// Validates `config` and builds every service around `collaborators`.
    pub fn new(config: FrontendConfig, collaborators: Collaborators) -> GatewayResult<Self> {
        let config = config.validated();
        let probe_timeout = Duration::from_millis(config.availability.probe_timeout_ms);

        let pools = Arc::new(ThreadPoolProvider::new(&config.pools)?);
        let registry = Arc::new(TriggerRegistry::new());
        let lifecycle = Arc::new(TriggerLifecycleManager::new(
            Arc::clone(&registry),
            collaborators.factory,
            config.availability.probe_enabled,
        ));
        let bulk = Arc::new(BulkActivationCoordinator::new(
            Arc::clone(&lifecycle),
            Arc::clone(&collaborators.backend),
            Arc::clone(&pools),
            config.bulk.max_wait(),
            probe_timeout,
        ));

        let mut sessions = SessionCorrelator::new(collaborators.execution, BackoffPolicy::from(&config.session));
        if let Some(responder) = collaborators.fast_path {
            sessions = sessions.with_fast_path(responder);
        }

        let dispatcher = ActivationDispatcher::new(
            Arc::clone(&lifecycle),
            Arc::clone(&bulk),
            collaborators.backend,
            collaborators.status,
            Arc::clone(&pools),
            config.startup.clone(),
            probe_timeout,
        );

        info!(
            control_workers = config.pools.control_workers,
            fan_out_threads = config.pools.fan_out_threads,
            probe_enabled = config.availability.probe_enabled,
            "front end ready"
        );

        Ok(Self {
            config,
            pools,
            registry,
            lifecycle,
            bulk,
            sessions: Arc::new(sessions),
            dispatcher,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Effective (validated) configuration.
    #[must_use]
    pub const fn config(&self) -> &FrontendConfig {
        &self.config
    }

    /// Live trigger registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    /// Single-trigger lifecycle manager.
    #[must_use]
    pub const fn lifecycle(&self) -> &Arc<TriggerLifecycleManager> {
        &self.lifecycle
    }

    /// Bulk coordinator.
    #[must_use]
    pub const fn bulk(&self) -> &Arc<BulkActivationCoordinator> {
        &self.bulk
    }

    /// Session correlator for protocol request threads.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionCorrelator> {
        &self.sessions
    }

    /// Control event dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &ActivationDispatcher {
        &self.dispatcher
    }

    /// Worker pools.
    #[must_use]
    pub const fn pools(&self) -> &Arc<ThreadPoolProvider> {
        &self.pools
    }

    /// Drains queued control events, deactivates every trigger and releases
    /// session waiters. Bulk items still running on the fan-out pool cannot
    /// leave a trigger live afterwards.
    ///
    /// Only the first call does any work; later calls return an empty report.
    pub fn shutdown(&self) -> GatewayResult<ShutdownReport> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(ShutdownReport {
                triggers_stopped: 0,
                sessions_interrupted: 0,
            });
        }

        self.pools.shutdown();
        let triggers_stopped = self.lifecycle.shutdown_all()?;
        let sessions_interrupted = self.sessions.interrupt_all();

        info!(triggers_stopped, sessions_interrupted, "front end shut down");
        Ok(ShutdownReport {
            triggers_stopped,
            sessions_interrupted,
        })
    }
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("pools", &self.pools)
            .field("registry", &self.registry)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
