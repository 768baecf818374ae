//! Error types for the CLI runtime.

use std::io;
use std::sync::Arc;

use enclave_plugins::PluginError;
use thiserror::Error;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("{}: {}", .0.kind(), .0)]
    Plugin(#[from] PluginError),
    #[error("argument {position} is not valid JSON: {source}")]
    InvalidArgument {
        position: usize,
        source: serde_json::Error,
    },
    #[error("failed to serialise output: {0}")]
    Serialise(serde_json::Error),
    #[error("failed to write output: {0}")]
    Write(io::Error),
}
