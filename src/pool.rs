//! Worker pools for control messages and per-trigger fan-out.
//!
//! Control messages run on a small bounded worker pool so the message
//! delivery thread never blocks on trigger work. Bulk actions run on a
//! separate rayon fork-join pool so a large batch cannot starve control
//! message handling. Panics in either pool are logged and never take down
//! the pool or other queued work.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error};

use crate::config::PoolConfig;
use crate::error::{DispatchError, GatewayError, GatewayResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct WorkerPool {
    tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(name: &'static str, workers: usize, queue_capacity: usize) -> GatewayResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Task>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Task> = rx.clone();
            let thread_name = format!("stubgate-{name}-{idx}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                            error!(
                                worker = %thread_name,
                                panic = %panic_message(payload.as_ref()),
                                "task panicked"
                            );
                        }
                    }
                    debug!(worker = %thread_name, "worker exiting");
                })
                .map_err(|e| GatewayError::internal(format!("failed to spawn {name} worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            queue_capacity,
        })
    }

    fn try_submit(&self, task: Task, path: &str) -> Result<(), DispatchError> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(DispatchError::Disconnected { path: path.to_string() });
        };
        match tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull {
                path: path.to_string(),
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Disconnected { path: path.to_string() }),
        }
    }

    fn shutdown(&self) {
        // Close the channel: workers drain queued tasks then exit.
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = thread::current().id();
        for handle in handles {
            // A task shutting down its own pool cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

/// Owns the control worker pool and the fan-out pool.
///
/// One provider is constructed per process and shared by reference.
pub struct ThreadPoolProvider {
    control: WorkerPool,
    fan_out: rayon::ThreadPool,
}

impl ThreadPoolProvider {
    /// Starts both pools sized from `config`.
    pub fn new(config: &PoolConfig) -> GatewayResult<Self> {
        let control = WorkerPool::start("control", config.control_workers, config.control_queue_capacity)?;
        let fan_out = rayon::ThreadPoolBuilder::new()
            .num_threads(config.fan_out_threads.max(1))
            .thread_name(|idx| format!("stubgate-fanout-{idx}"))
            .panic_handler(|payload| {
                error!(panic = %panic_message(payload.as_ref()), "fan-out task panicked");
            })
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build fan-out pool: {e}")))?;

        Ok(Self { control, fan_out })
    }

    /// Queues `task` on the control pool without blocking.
    ///
    /// Fails with `QueueFull` when the bounded queue is at capacity and with
    /// `Disconnected` after shutdown.
    pub fn submit<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.control.try_submit(Box::new(task), "control")
    }

    /// The fork-join pool used for bulk fan-out.
    #[must_use]
    pub const fn fan_out(&self) -> &rayon::ThreadPool {
        &self.fan_out
    }

    /// Stops accepting control tasks, drains the queue and joins the workers.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        self.control.shutdown();
    }
}

impl std::fmt::Debug for ThreadPoolProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolProvider")
            .field("control_queue_capacity", &self.control.queue_capacity)
            .field("fan_out_threads", &self.fan_out.current_num_threads())
            .finish()
    }
}

impl Drop for ThreadPoolProvider {
    fn drop(&mut self) {
        self.control.shutdown();
    }
}
