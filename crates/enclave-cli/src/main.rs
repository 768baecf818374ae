//! CLI entrypoint for the plugin host.
//!
//! The binary delegates to [`enclave_cli::run`], which loads configuration,
//! installs telemetry, and dispatches the requested plugin command.

use std::io::{self, StderrLock, StdoutLock};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout: StdoutLock<'_> = io::stdout().lock();
    let mut stderr: StderrLock<'_> = io::stderr().lock();
    enclave_cli::run(std::env::args_os(), &mut stdout, &mut stderr)
}
