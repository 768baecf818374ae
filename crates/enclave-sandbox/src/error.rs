//! Domain errors raised by the isolate.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while preparing an isolate or running code inside it.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Execution ran past the CPU-time budget and was aborted.
    #[error("execution exceeded its {limit_ms} ms deadline")]
    DeadlineExceeded {
        /// Budget that was exceeded, in milliseconds.
        limit_ms: u64,
    },

    /// Script code reached for a capability outside the allow-list.
    #[error("access to '{capability}' is not permitted inside the sandbox")]
    CapabilityDenied {
        /// Name of the denied capability, for example `io.open`.
        capability: String,
    },

    /// The script allocated past the memory ceiling.
    #[error("script exceeded its memory ceiling of {limit_bytes} bytes")]
    MemoryExhausted {
        /// Ceiling applied to the Lua allocator.
        limit_bytes: usize,
    },

    /// Any other error raised by the script itself.
    #[error("script error: {message}")]
    Script {
        /// Rendered Lua error.
        message: String,
    },

    /// The value returned by the entry point is not a usable export table.
    #[error("invalid exports: {message}")]
    InvalidExports {
        /// Description of the offending export.
        message: String,
    },

    /// The entry point source could not be read from disk.
    #[error("failed to read entry point {path}: {source}")]
    EntryPoint {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The Lua state could not be created or configured.
    #[error("failed to prepare isolate: {0}")]
    Setup(#[source] mlua::Error),
}
