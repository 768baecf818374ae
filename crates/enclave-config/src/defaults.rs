use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Default directory scanned for plugins, relative to the working directory.
pub const DEFAULT_PLUGINS_DIR: &str = "plugins";

/// Default log filter expression used by the binary.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default plugin directory.
#[must_use]
pub fn default_plugins_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_PLUGINS_DIR)
}

/// Default log filter expression used by the binary.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binary.
///
/// Compact rather than JSON: `enclave` is run by hand at a terminal, and the
/// only stream a person reads there is stderr. Set `log_format = "json"` when
/// shipping logs to a collector.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Compact
}
