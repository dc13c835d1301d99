//! Runtime configuration.
//!
//! Configuration is loaded from JSON (file or string), then range-checked by
//! [`FrontendConfig::validated`]. Any out-of-range value is replaced by its
//! default and a warning naming the field is logged; loading never fails on
//! a bad number.

use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::trigger::TransportKind;

/// Thread pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers handling control messages.
    pub control_workers: usize,
    /// Max queued control messages before submissions are rejected.
    pub control_queue_capacity: usize,
    /// Threads in the fork-join fan-out pool.
    pub fan_out_threads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            control_workers: 4,
            control_queue_capacity: 1024,
            fan_out_threads: 16,
        }
    }
}

/// Bulk coordinator limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Max time a caller waits for a batch to complete.
    pub max_wait_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self { max_wait_ms: 120_000 }
    }
}

impl BulkConfig {
    /// `max_wait_ms` as a duration.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Session correlator backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// First poll interval.
    pub base_interval_ms: u64,
    /// Interval growth factor after each empty poll.
    pub multiplier: f64,
    /// Poll interval cap.
    pub max_interval_ms: u64,
    /// Max total wait for one response.
    pub total_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 100,
            multiplier: 1.2,
            max_interval_ms: 800,
            total_timeout_ms: 60_000,
        }
    }
}

/// Fleet startup sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Protocol priority tiers, activated in order.
    pub tiers: Vec<Vec<TransportKind>>,
    /// Pause between tiers.
    pub tier_delay_ms: u64,
    /// Max wait for one tier's bulk activation.
    pub tier_timeout_ms: u64,
    /// Attempts to retrieve the trigger list.
    pub retry_attempts: u32,
    /// Delay between retrieval attempts.
    pub retry_delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                vec![TransportKind::Tcp, TransportKind::Http, TransportKind::Grpc],
                vec![TransportKind::Mqtt, TransportKind::Amqp, TransportKind::Kafka],
            ],
            tier_delay_ms: 2_000,
            tier_timeout_ms: 300_000,
            retry_attempts: 10,
            retry_delay_ms: 5_000,
        }
    }
}

/// Pre-flight reachability probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// Probe targets before activation.
    pub probe_enabled: bool,
    /// Timeout for one probe.
    pub probe_timeout_ms: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            probe_enabled: true,
            probe_timeout_ms: 2_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive.
    pub log_filter: String,
    /// Output format.
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "stubgate=info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

/// Complete front-end configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub pools: PoolConfig,
    pub bulk: BulkConfig,
    pub session: SessionConfig,
    pub startup: StartupConfig,
    pub availability: AvailabilityConfig,
    pub telemetry: TelemetryConfig,
}

fn in_range<T>(field: &str, value: T, min: T, max: T, default: T) -> T
where
    T: PartialOrd + Copy + Display,
{
    if value >= min && value <= max {
        value
    } else {
        warn!(field, %value, %min, %max, %default, "config value out of range, using default");
        default
    }
}

impl FrontendConfig {
    /// Parses JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|source| ConfigError::Parse { source })
    }

    /// Reads and parses a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Loads the optional file, or the defaults when `path` is `None`, and
    /// validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_path(p)?,
            None => Self::default(),
        };
        Ok(base.validated())
    }

    /// Range-checks every numeric field, falling back to defaults.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let d = Self::default();

        let p = &mut self.pools;
        p.control_workers = in_range("pools.control_workers", p.control_workers, 1, 256, d.pools.control_workers);
        p.control_queue_capacity = in_range(
            "pools.control_queue_capacity",
            p.control_queue_capacity,
            1,
            1_000_000,
            d.pools.control_queue_capacity,
        );
        p.fan_out_threads = in_range("pools.fan_out_threads", p.fan_out_threads, 1, 512, d.pools.fan_out_threads);

        self.bulk.max_wait_ms = in_range("bulk.max_wait_ms", self.bulk.max_wait_ms, 100, 3_600_000, d.bulk.max_wait_ms);

        let s = &mut self.session;
        s.base_interval_ms = in_range("session.base_interval_ms", s.base_interval_ms, 1, 60_000, d.session.base_interval_ms);
        s.multiplier = if s.multiplier.is_finite() {
            in_range("session.multiplier", s.multiplier, 1.0, 10.0, d.session.multiplier)
        } else {
            warn!(field = "session.multiplier", "non-finite multiplier, using default");
            d.session.multiplier
        };
        s.max_interval_ms = in_range("session.max_interval_ms", s.max_interval_ms, 1, 60_000, d.session.max_interval_ms);
        if s.max_interval_ms < s.base_interval_ms {
            warn!(
                max_interval_ms = s.max_interval_ms,
                base_interval_ms = s.base_interval_ms,
                "session.max_interval_ms below base interval, raising to base"
            );
            s.max_interval_ms = s.base_interval_ms;
        }
        s.total_timeout_ms = in_range("session.total_timeout_ms", s.total_timeout_ms, 1, 3_600_000, d.session.total_timeout_ms);

        let st = &mut self.startup;
        if st.tiers.iter().all(Vec::is_empty) {
            warn!(field = "startup.tiers", "no startup tiers configured, using default");
            st.tiers = d.startup.tiers.clone();
        }
        st.tier_delay_ms = in_range("startup.tier_delay_ms", st.tier_delay_ms, 0, 600_000, d.startup.tier_delay_ms);
        st.tier_timeout_ms = in_range("startup.tier_timeout_ms", st.tier_timeout_ms, 100, 3_600_000, d.startup.tier_timeout_ms);
        st.retry_attempts = in_range("startup.retry_attempts", st.retry_attempts, 1, 1_000, d.startup.retry_attempts);
        st.retry_delay_ms = in_range("startup.retry_delay_ms", st.retry_delay_ms, 0, 600_000, d.startup.retry_delay_ms);

        self.availability.probe_timeout_ms = in_range(
            "availability.probe_timeout_ms",
            self.availability.probe_timeout_ms,
            1,
            60_000,
            d.availability.probe_timeout_ms,
        );

        if self.telemetry.log_filter.trim().is_empty() {
            self.telemetry.log_filter = d.telemetry.log_filter;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = FrontendConfig::from_json_str(r#"{ "bulk": { "max_wait_ms": 5000 } }"#).unwrap();
        assert_eq!(cfg.bulk.max_wait_ms, 5000);
        assert_eq!(cfg.session, SessionConfig::default());
        assert_eq!(cfg.pools, PoolConfig::default());
    }

    #[test]
    fn out_of_range_values_fall_back_to_defaults() {
        let mut cfg = FrontendConfig::default();
        cfg.pools.control_workers = 0;
        cfg.pools.fan_out_threads = 10_000;
        cfg.session.multiplier = 0.5;
        cfg.startup.retry_attempts = 0;
        cfg.bulk.max_wait_ms = 1;

        let cfg = cfg.validated();
        assert_eq!(cfg.pools.control_workers, 4);
        assert_eq!(cfg.pools.fan_out_threads, 16);
        assert!((cfg.session.multiplier - 1.2).abs() < f64::EPSILON);
        assert_eq!(cfg.startup.retry_attempts, 10);
        assert_eq!(cfg.bulk.max_wait_ms, 120_000);
    }

    #[test]
    fn non_finite_multiplier_falls_back() {
        let mut cfg = FrontendConfig::default();
        cfg.session.multiplier = f64::NAN;
        assert!((cfg.validated().session.multiplier - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn max_interval_is_raised_to_base() {
        let mut cfg = FrontendConfig::default();
        cfg.session.base_interval_ms = 500;
        cfg.session.max_interval_ms = 100;
        assert_eq!(cfg.validated().session.max_interval_ms, 500);
    }

    #[test]
    fn empty_tiers_fall_back() {
        let mut cfg = FrontendConfig::default();
        cfg.startup.tiers = vec![vec![]];
        assert_eq!(cfg.validated().startup.tiers, StartupConfig::default().tiers);
    }

    #[test]
    fn load_validates_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "pools": {{ "control_workers": 0 }}, "session": {{ "multiplier": 2.0 }} }}"#
        )
        .unwrap();

        let cfg = FrontendConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.pools.control_workers, 4);
        assert!((cfg.session.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn load_without_path_is_default() {
        assert_eq!(FrontendConfig::load(None).unwrap(), FrontendConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "startup": {{ "tiers": [["kafka"], ["http"]], "retry_attempts": 3 }} }}"#
        )
        .unwrap();

        let cfg = FrontendConfig::from_path(file.path()).unwrap().validated();
        assert_eq!(cfg.startup.tiers, vec![vec![TransportKind::Kafka], vec![TransportKind::Http]]);
        assert_eq!(cfg.startup.retry_attempts, 3);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FrontendConfig::from_path(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let err = FrontendConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
