//! Diagnostic logging for the `enclave` binary.
//!
//! Command results are written to stdout so they can be piped into other
//! tools. Every diagnostic, including plugin console lines mirrored under
//! the `enclave_sandbox::console` target, goes to stderr instead.

use std::io::{self, IsTerminal};

use enclave_config::{Config, LogFormat};
use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, time::UtcTime};

/// Set once a subscriber is in place for the process.
static INSTALLED: OnceCell<()> = OnceCell::new();

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Reasons the diagnostic log could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// `log_filter` is not a valid `tracing` directive list.
    #[error("invalid log filter '{filter}': {reason}")]
    Filter {
        /// The rejected expression.
        filter: String,
        /// Parser message.
        reason: String,
    },
    /// Something else already owns the global subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the stderr logger described by `config`.
///
/// Only the first successful call has an effect; the CLI runs one command per
/// process, so later configurations are ignored.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter does not parse or another
/// subscriber is already installed.
pub fn initialise(config: &Config) -> Result<(), TelemetryError> {
    INSTALLED.get_or_try_init(|| {
        let filter = parse_filter(config.log_filter())?;
        tracing::subscriber::set_global_default(stderr_subscriber(config.log_format(), filter))
            .map_err(TelemetryError::Subscriber)
    })?;
    Ok(())
}

fn parse_filter(expression: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(expression).map_err(|error| TelemetryError::Filter {
        filter: expression.to_owned(),
        reason: error.to_string(),
    })
}

fn stderr_subscriber(format: LogFormat, filter: EnvFilter) -> BoxedSubscriber {
    let colour = io::stderr().is_terminal();
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_names(false)
        .with_timer(UtcTime::rfc_3339());
    match format {
        // Machine consumers get one flat object per event and never colour.
        LogFormat::Json => Box::new(builder.json().flatten_event(true).with_ansi(false).finish()),
        LogFormat::Compact => Box::new(builder.compact().with_ansi(colour).finish()),
    }
}
