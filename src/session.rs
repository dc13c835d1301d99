//! Session correlation between blocking protocol threads and the backend.
//!
//! A protocol handler thread calls [`SessionCorrelator::request`]: a fresh
//! session id is generated, the request is published tagged with it, and the
//! thread polls with capped exponential backoff until the matching response
//! is delivered, the total wait elapses, or the session is interrupted.
//!
//! Correlation state exists only between `send` and the end of `wait`, or
//! until [`SessionCorrelator::cancel`]. A response for an id with no slot
//! (already consumed, timed out, or never sent from here) is logged and
//! dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{DispatchError, GatewayResult};
use crate::trigger::TriggerId;

/// Opaque correlation id, one per inbound protocol request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request published on the outbound execution channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Correlation id the response must carry.
    pub session_id: SessionId,
    /// Trigger that received the protocol request.
    pub trigger_id: TriggerId,
    /// Decoded protocol request.
    pub payload: serde_json::Value,
    /// Publication time.
    pub sent_at: DateTime<Utc>,
}

/// Response delivered on the inbound response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    /// Correlation id copied from the request.
    pub session_id: SessionId,
    /// Synthesized protocol response.
    pub payload: serde_json::Value,
}

/// Outbound execution channel.
pub trait ExecutionChannel: Send + Sync {
    /// Publishes one request. Exactly one call per session id.
    fn publish(&self, request: ExecutionRequest) -> Result<(), DispatchError>;
}

/// [`ExecutionChannel`] backed by a bounded crossbeam channel.
#[derive(Debug, Clone)]
pub struct CrossbeamExecutionChannel {
    tx: Sender<ExecutionRequest>,
    capacity: usize,
}

impl CrossbeamExecutionChannel {
    /// Creates the channel and returns the receiving half for the transport.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<ExecutionRequest>) {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        (Self { tx, capacity }, rx)
    }
}

impl ExecutionChannel for CrossbeamExecutionChannel {
    fn publish(&self, request: ExecutionRequest) -> Result<(), DispatchError> {
        self.tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => DispatchError::QueueFull {
                path: "execution".to_string(),
                capacity: self.capacity,
            },
            TrySendError::Disconnected(_) => DispatchError::Disconnected {
                path: "execution".to_string(),
            },
        })
    }
}

/// Local responder consulted before a backend round trip.
pub trait FastPathResponder: Send + Sync {
    /// Returns a response if one can be synthesized locally.
    fn respond(&self, trigger_id: &TriggerId, payload: &serde_json::Value) -> Option<serde_json::Value>;
}

/// Capped exponential backoff for session polling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First poll interval.
    pub base: Duration,
    /// Growth factor after each empty poll.
    pub multiplier: f64,
    /// Interval cap.
    pub max_interval: Duration,
    /// Max total wait.
    pub total: Duration,
}

impl BackoffPolicy {
    /// Interval following `current`.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max_interval)
    }

    /// Copy safe to drive a wait loop: the multiplier is finite and within
    /// `1.0..=10.0`, `base` is at least 1ms and `max_interval` at least
    /// `base`.
    #[must_use]
    pub fn sanitized(self) -> Self {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.clamp(1.0, MAX_MULTIPLIER)
        } else {
            1.0
        };
        let base = self.base.max(MIN_INTERVAL);
        Self {
            base,
            multiplier,
            max_interval: self.max_interval.max(base),
            total: self.total,
        }
    }
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_MULTIPLIER: f64 = 10.0;

impl From<&SessionConfig> for BackoffPolicy {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_interval_ms),
            multiplier: cfg.multiplier,
            max_interval: Duration::from_millis(cfg.max_interval_ms),
            total: Duration::from_millis(cfg.total_timeout_ms),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Waiting,
    Ready(ExecutionResponse),
    Interrupted,
}

enum Poll {
    Ready(ExecutionResponse),
    Pending,
    Gone,
}

/// Bridges blocking protocol threads onto asynchronous backend responses.
pub struct SessionCorrelator {
    channel: Arc<dyn ExecutionChannel>,
    fast_path: Option<Arc<dyn FastPathResponder>>,
    slots: Mutex<HashMap<SessionId, Slot>>,
    backoff: BackoffPolicy,
    dropped_responses: AtomicU64,
}

impl SessionCorrelator {
    /// Creates a correlator publishing on `channel`. `backoff` is stored
    /// [sanitized](BackoffPolicy::sanitized).
    #[must_use]
    pub fn new(channel: Arc<dyn ExecutionChannel>, backoff: BackoffPolicy) -> Self {
        Self {
            channel,
            fast_path: None,
            slots: Mutex::new(HashMap::new()),
            backoff: backoff.sanitized(),
            dropped_responses: AtomicU64::new(0),
        }
    }

    /// Installs a fast-path responder.
    #[must_use]
    pub fn with_fast_path(mut self, responder: Arc<dyn FastPathResponder>) -> Self {
        self.fast_path = Some(responder);
        self
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a session and publishes `payload` tagged with its id.
    ///
    /// The slot is registered before publishing, so a response that arrives
    /// before the caller starts waiting is kept for the first poll.
    pub fn send(&self, trigger_id: &TriggerId, payload: serde_json::Value) -> GatewayResult<SessionId> {
        let session_id = SessionId::new();
        self.slots().insert(session_id, Slot::Waiting);

        let request = ExecutionRequest {
            session_id,
            trigger_id: trigger_id.clone(),
            payload,
            sent_at: Utc::now(),
        };
        if let Err(err) = self.channel.publish(request) {
            self.slots().remove(&session_id);
            return Err(err.into());
        }
        debug!(session = %session_id, trigger = %trigger_id, "request published");
        Ok(session_id)
    }

    /// Blocks until the response for `session_id` arrives.
    ///
    /// Returns `None` when the total wait elapses, the session is interrupted,
    /// or the id is unknown. The session's slot is gone afterwards in every
    /// case.
    pub fn wait(&self, session_id: SessionId) -> Option<ExecutionResponse> {
        let started = Instant::now();
        let mut interval = self.backoff.base;

        loop {
            match self.poll(session_id) {
                Poll::Ready(response) => return Some(response),
                Poll::Gone => return None,
                Poll::Pending => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.backoff.total {
                // A response may land between the poll above and this removal.
                if let Some(Slot::Ready(response)) = self.slots().remove(&session_id) {
                    return Some(response);
                }
                debug!(session = %session_id, waited_ms = elapsed.as_millis(), "session timed out");
                return None;
            }

            thread::sleep(interval.min(self.backoff.total - elapsed));
            interval = self.backoff.next(interval);
        }
    }

    fn poll(&self, session_id: SessionId) -> Poll {
        let mut slots = self.slots();
        match slots.get(&session_id) {
            Some(Slot::Waiting) => return Poll::Pending,
            None => return Poll::Gone,
            Some(Slot::Ready(_) | Slot::Interrupted) => {}
        }
        match slots.remove(&session_id) {
            Some(Slot::Ready(response)) => Poll::Ready(response),
            _ => {
                debug!(session = %session_id, "session wait interrupted");
                Poll::Gone
            }
        }
    }

    /// `send` followed by `wait`, consulting the fast path first.
    ///
    /// `Ok(None)` means no response arrived in time.
    pub fn request(
        &self,
        trigger_id: &TriggerId,
        payload: serde_json::Value,
    ) -> GatewayResult<Option<serde_json::Value>> {
        if let Some(local) = self.fast_path.as_ref().and_then(|fp| fp.respond(trigger_id, &payload)) {
            debug!(trigger = %trigger_id, "served from fast path");
            return Ok(Some(local));
        }
        let session_id = self.send(trigger_id, payload)?;
        Ok(self.wait(session_id).map(|response| response.payload))
    }

    /// Delivers an inbound response.
    ///
    /// Returns true if a waiting session accepted it. Duplicates and responses
    /// for unknown or finished sessions are logged and dropped. A response for
    /// an interrupted session also discards that session's slot.
    pub fn deliver(&self, response: ExecutionResponse) -> bool {
        let session_id = response.session_id;
        let mut slots = self.slots();
        match slots.get_mut(&session_id) {
            Some(slot @ Slot::Waiting) => {
                *slot = Slot::Ready(response);
                true
            }
            Some(Slot::Ready(_)) => {
                self.dropped_responses.fetch_add(1, Ordering::Relaxed);
                warn!(session = %session_id, "duplicate response ignored");
                false
            }
            Some(Slot::Interrupted) => {
                slots.remove(&session_id);
                self.dropped_responses.fetch_add(1, Ordering::Relaxed);
                warn!(session = %session_id, "response for interrupted session ignored");
                false
            }
            None => {
                self.dropped_responses.fetch_add(1, Ordering::Relaxed);
                warn!(session = %session_id, "response for inactive session ignored");
                false
            }
        }
    }

    /// Wakes the waiter of `session_id` with `None`. Returns false if the
    /// session is not pending.
    pub fn interrupt(&self, session_id: SessionId) -> bool {
        match self.slots().get_mut(&session_id) {
            Some(slot @ Slot::Waiting) => {
                *slot = Slot::Interrupted;
                true
            }
            _ => false,
        }
    }

    /// Discards the slot of `session_id` whatever its state, for callers that
    /// `send` and then abandon the session without calling `wait`. A later
    /// response for it is dropped. Returns false if no slot existed.
    pub fn cancel(&self, session_id: SessionId) -> bool {
        let removed = self.slots().remove(&session_id).is_some();
        if removed {
            debug!(session = %session_id, "session cancelled");
        }
        removed
    }

    /// Interrupts every pending session. Returns how many were interrupted.
    pub fn interrupt_all(&self) -> usize {
        let mut slots = self.slots();
        let mut interrupted = 0;
        for slot in slots.values_mut() {
            if matches!(slot, Slot::Waiting) {
                *slot = Slot::Interrupted;
                interrupted += 1;
            }
        }
        interrupted
    }

    /// Sessions currently holding correlation state.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.slots().len()
    }

    /// Responses dropped as duplicate, late or unknown.
    #[must_use]
    pub fn dropped_responses(&self) -> u64 {
        self.dropped_responses.load(Ordering::Relaxed)
    }

    /// Backoff policy in use.
    #[must_use]
    pub const fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

impl fmt::Debug for SessionCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCorrelator")
            .field("backoff", &self.backoff)
            .field("open_sessions", &self.open_sessions())
            .field("fast_path", &self.fast_path.is_some())
            .finish()
    }
}

/// Spawns a thread that forwards responses from `rx` into `correlator` until
/// the channel closes.
pub fn spawn_response_pump(
    correlator: Arc<SessionCorrelator>,
    rx: Receiver<ExecutionResponse>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("stubgate-responses".to_string())
        .spawn(move || {
            for response in rx {
                correlator.deliver(response);
            }
            debug!("response channel closed");
        })
}
