//! Plugin command execution.
//!
//! Every command writes newline-delimited JSON to stdout. Plugin console
//! output never reaches stdout; it is mirrored to the log stream instead.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8Path;
use enclave_plugins::{LoadFailure, LuaRunner, PluginLoader, PluginRegistry};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::AppError;

const COMMAND_TARGET: &str = "enclave_cli::command";

/// JSON line describing a plugin directory that failed to load.
#[derive(Debug, Serialize)]
struct FailureLine {
    directory: String,
    kind: &'static str,
    message: String,
}

impl From<&LoadFailure> for FailureLine {
    fn from(failure: &LoadFailure) -> Self {
        Self {
            directory: failure.directory().display().to_string(),
            kind: failure.error().kind().as_str(),
            message: failure.error().to_string(),
        }
    }
}

fn loader() -> PluginLoader<LuaRunner> {
    PluginLoader::new(LuaRunner::new(), Arc::new(PluginRegistry::new()))
}

fn emit<W: Write, T: Serialize + ?Sized>(stdout: &mut W, line: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string(line).map_err(AppError::Serialise)?;
    writeln!(stdout, "{rendered}").map_err(AppError::Write)
}

/// Loads every plugin under `root`.
///
/// Per-plugin failures are printed, not returned: the command only fails
/// when `root` cannot be listed.
pub(crate) fn list<W: Write>(root: &Utf8Path, stdout: &mut W) -> Result<ExitCode, AppError> {
    debug!(target: COMMAND_TARGET, root = %root, "listing plugins");
    let report = loader().load_all_plugins(root.as_std_path())?;
    for plugin in report.loaded() {
        emit(stdout, &plugin.summary())?;
    }
    for failure in report.failures() {
        emit(stdout, &FailureLine::from(failure))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Loads the plugin in `directory` and prints its summary.
pub(crate) fn load<W: Write>(directory: &Utf8Path, stdout: &mut W) -> Result<ExitCode, AppError> {
    let plugin = loader().load_plugin(directory.as_std_path())?;
    emit(stdout, &plugin.summary())?;
    Ok(ExitCode::SUCCESS)
}

/// Loads the plugin in `directory` and calls `export` with JSON arguments.
pub(crate) fn call<W: Write>(
    directory: &Utf8Path,
    export: &str,
    arguments: &[String],
    stdout: &mut W,
) -> Result<ExitCode, AppError> {
    let values = parse_arguments(arguments)?;
    let plugin = loader().load_plugin(directory.as_std_path())?;
    debug!(
        target: COMMAND_TARGET,
        plugin = plugin.name(),
        export,
        arguments = values.len(),
        "calling export"
    );
    let reply = plugin.call(export, &values)?;
    emit(stdout, &reply)?;
    Ok(ExitCode::SUCCESS)
}

fn parse_arguments(arguments: &[String]) -> Result<Vec<Value>, AppError> {
    arguments
        .iter()
        .zip(1..)
        .map(|(text, position)| {
            serde_json::from_str(text)
                .map_err(|source| AppError::InvalidArgument { position, source })
        })
        .collect()
}
