//! Domain errors raised by plugin operations.
//!
//! All errors use `thiserror`-derived enums with structured context so callers
//! can inspect the failure programmatically. I/O errors are wrapped in `Arc`
//! to satisfy the `result_large_err` Clippy lint.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Stable, machine-readable label for each [`PluginError`] variant.
///
/// The label is what logs and the CLI print; it does not change when error
/// messages are reworded.
///
/// # Example
///
/// ```
/// use enclave_plugins::ErrorKind;
///
/// assert_eq!(ErrorKind::Quota.as_str(), "quota");
/// assert_eq!(ErrorKind::CapabilityViolation.to_string(), "capability_violation");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The manifest file does not exist.
    ManifestNotFound,
    /// The manifest is unreadable or structurally invalid.
    InvalidManifest,
    /// Quotas are missing or not positive integers.
    Quota,
    /// Execution ran past the CPU-time quota.
    Timeout,
    /// Code reached for a capability outside the allow-list.
    CapabilityViolation,
    /// The code failed for any other reason.
    Execution,
    /// Execution ran past the memory quota.
    MemoryLimit,
    /// The named plugin is not registered.
    NotFound,
    /// The plugin root could not be enumerated.
    Io,
}

impl ErrorKind {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManifestNotFound => "manifest_not_found",
            Self::InvalidManifest => "invalid_manifest",
            Self::Quota => "quota",
            Self::Timeout => "timeout",
            Self::CapabilityViolation => "capability_violation",
            Self::Execution => "execution",
            Self::MemoryLimit => "memory_limit",
            Self::NotFound => "not_found",
            Self::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors arising from plugin operations.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// No manifest exists at the expected location.
    #[error("plugin manifest not found at {path}")]
    ManifestNotFound {
        /// Path that was checked.
        path: PathBuf,
    },

    /// The manifest could not be parsed or is missing a required field.
    #[error("invalid plugin manifest {path}: {message}")]
    InvalidManifest {
        /// Manifest path, or the plugin directory for in-memory manifests.
        path: PathBuf,
        /// Description of the validation failure.
        message: String,
    },

    /// Quotas are absent or cannot be resolved to positive integers.
    #[error("plugin '{name}' has an unusable quota field '{field}': {message}")]
    Quota {
        /// Plugin name.
        name: String,
        /// Offending manifest field, for example `quotas.cpuMs`.
        field: String,
        /// Why the field was rejected.
        message: String,
    },

    /// Execution did not complete within the CPU-time quota.
    #[error("plugin '{name}' timed out after {cpu_ms} ms")]
    Timeout {
        /// Plugin name.
        name: String,
        /// Configured quota in milliseconds.
        cpu_ms: u64,
    },

    /// The plugin touched a capability outside the allow-list.
    #[error("plugin '{name}' attempted to use '{capability}', which is not permitted")]
    CapabilityViolation {
        /// Plugin name.
        name: String,
        /// Denied capability, for example `io.open` or `require:socket`.
        capability: String,
    },

    /// The plugin code failed: syntax error, runtime error, or bad exports.
    #[error("plugin '{name}' failed: {message}")]
    Execution {
        /// Plugin name.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// The plugin allocated past the memory quota.
    #[error("plugin '{name}' exceeded its memory quota of {mem_kb} KB")]
    MemoryLimit {
        /// Plugin name.
        name: String,
        /// Configured quota in kilobytes.
        mem_kb: u64,
    },

    /// The requested plugin was not found in the registry.
    #[error("plugin '{name}' not found in registry")]
    NotFound {
        /// Name that was looked up.
        name: String,
    },

    /// A filesystem operation outside a single manifest failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl PluginError {
    /// Returns the stable kind label for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestNotFound { .. } => ErrorKind::ManifestNotFound,
            Self::InvalidManifest { .. } => ErrorKind::InvalidManifest,
            Self::Quota { .. } => ErrorKind::Quota,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CapabilityViolation { .. } => ErrorKind::CapabilityViolation,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::MemoryLimit { .. } => ErrorKind::MemoryLimit,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests;
