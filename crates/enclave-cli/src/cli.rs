//! CLI argument definitions for the plugin host.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// Command-line interface for the plugin host.
#[derive(Parser, Debug)]
#[command(
    name = "enclave",
    version,
    about = "Loads plugin directories and runs their code in a sandbox",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// The plugin command to run.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Plugin commands.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum CliCommand {
    /// Loads every plugin under the plugins directory and prints one JSON
    /// line per plugin or failure.
    List {
        /// Overrides the configured plugins directory.
        #[arg(long, value_name = "DIR")]
        plugins_dir: Option<Utf8PathBuf>,
    },
    /// Loads a single plugin directory and prints its summary.
    Load {
        /// Plugin directory containing `plugin.json`.
        #[arg(value_name = "DIR")]
        directory: Utf8PathBuf,
    },
    /// Loads a plugin and calls one of its exported functions.
    Call {
        /// Plugin directory containing `plugin.json`.
        #[arg(value_name = "DIR")]
        directory: Utf8PathBuf,
        /// Name of the exported function.
        #[arg(value_name = "EXPORT")]
        export: String,
        /// Arguments, each a JSON document.
        #[arg(value_name = "ARGS_JSON", num_args = 0.., allow_hyphen_values = true)]
        arguments: Vec<String>,
    },
}
