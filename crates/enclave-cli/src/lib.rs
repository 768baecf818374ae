//! Command-line runtime for the plugin host.
//!
//! The runtime splits configuration flags from the command, loads
//! [`enclave_config::Config`], installs telemetry, and runs one plugin
//! command. Output streams are injected so tests can capture them.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use enclave_config::Config;

mod cli;
mod command;
mod config;
mod errors;
pub mod telemetry;

#[cfg(test)]
mod tests;

use cli::{Cli, CliCommand};
use config::{ConfigLoader, OrthoConfigLoader, split_config_arguments};
use errors::AppError;

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_loader(args, stdout, stderr, &OrthoConfigLoader)
}

pub(crate) fn run_with_loader<I, W, E, L>(
    args: I,
    stdout: &mut W,
    stderr: &mut E,
    loader: &L,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_config_arguments(&args);

    let result = Cli::try_parse_from(&split.command_arguments)
        .map_err(AppError::CliUsage)
        .and_then(|cli| {
            loader
                .load(&split.config_arguments)
                .map(|config| (cli, config))
        })
        .and_then(|(cli, config)| {
            telemetry::initialise(&config)?;
            execute(&cli.command, &config, stdout)
        });

    match result {
        Ok(exit_code) => exit_code,
        // `--help` and `--version` arrive as clap errors bound for stdout.
        Err(AppError::CliUsage(error)) if !error.use_stderr() => {
            drop(write!(stdout, "{error}"));
            ExitCode::SUCCESS
        }
        Err(error) => {
            drop(writeln!(stderr, "{error}"));
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write>(
    invocation: &CliCommand,
    config: &Config,
    stdout: &mut W,
) -> Result<ExitCode, AppError> {
    match invocation {
        CliCommand::List { plugins_dir } => {
            let root = plugins_dir.as_deref().unwrap_or_else(|| config.plugins_dir());
            command::list(root, stdout)
        }
        CliCommand::Load { directory } => command::load(directory, stdout),
        CliCommand::Call {
            directory,
            export,
            arguments,
        } => command::call(directory, export, arguments, stdout),
    }
}
