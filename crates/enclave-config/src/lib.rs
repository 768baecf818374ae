//! Shared configuration for the plugin host.
//!
//! [`Config`] is loaded through `ortho_config`, which layers values from
//! built-in defaults, a `.enclave.toml` file, `ENCLAVE_*` environment
//! variables, and command-line flags, with later layers winning.

mod defaults;
mod logging;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_PLUGINS_DIR, default_log_filter, default_log_filter_string,
    default_log_format, default_plugins_dir,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Command-line flags understood by [`Config`].
///
/// Binaries that mix configuration flags with their own commands use this
/// list to route arguments to the configuration loader.
pub const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--plugins-dir",
    "--log-filter",
    "--log-format",
];

/// Runtime configuration for the plugin host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(
    prefix = "ENCLAVE",
    discovery(
        app_name = "enclave",
        config_file_name = "enclave.toml",
        dotfile_name = ".enclave.toml",
        project_file_name = ".enclave.toml"
    )
)]
pub struct Config {
    /// Directory whose subdirectories are loaded as plugins.
    #[ortho_config(default = default_plugins_dir())]
    pub plugins_dir: Utf8PathBuf,
    /// `tracing` filter expression, in `EnvFilter` syntax.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Directory whose subdirectories are loaded as plugins.
    #[must_use]
    pub fn plugins_dir(&self) -> &Utf8Path {
        &self.plugins_dir
    }

    /// `tracing` filter expression.
    #[must_use]
    pub const fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}
