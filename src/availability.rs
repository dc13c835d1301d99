//! Reachability memoization for a single bulk run.
//!
//! A cache instance lives exactly as long as one coordinator invocation, so a
//! broker that was down during one batch is probed again in the next.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

/// Map `host:port+protocol` -> reachable.
#[derive(Debug)]
pub struct AvailabilityCache {
    entries: Mutex<HashMap<String, bool>>,
    probe_timeout: Duration,
}

impl AvailabilityCache {
    /// Creates an empty cache whose probes use `probe_timeout`.
    #[must_use]
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            probe_timeout,
        }
    }

    /// Returns the memoized result for `key`, running `probe` on first use.
    ///
    /// The probe runs without holding the cache lock. If two callers race on
    /// the same key the first stored answer wins.
    pub fn get_or_probe<F>(&self, key: &str, probe: F) -> bool
    where
        F: FnOnce(Duration) -> bool,
    {
        if let Some(known) = self.lookup(key) {
            return known;
        }

        let reachable = probe(self.probe_timeout);
        debug!(key, reachable, "availability probed");
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        *entries.entry(key.to_string()).or_insert(reachable)
    }

    /// Memoized result for `key`, if probed.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<bool> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Number of memoized keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing has been probed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probe timeout handed to listeners.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }
}

/// Plain TCP connect probe for broker-style listeners.
///
/// Returns true if any resolved address accepts a connection within `timeout`.
#[must_use]
pub fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}
