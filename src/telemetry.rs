//! Structured logging initialisation.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Subscriber;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, TelemetryConfig};

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Errors encountered while configuring logging.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured filter directive did not parse.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// A global subscriber was already installed by someone else.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global tracing subscriber on first call.
///
/// Later calls are no-ops and return `Ok(())`, so tests and embedders may
/// call this freely.
pub fn initialise(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    TELEMETRY_GUARD.get_or_try_init(|| install_subscriber(config)).map(|_| ())
}

fn install_subscriber(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(&config.log_filter).map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
