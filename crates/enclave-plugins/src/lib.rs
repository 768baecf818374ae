//! Plugin manifests, loading, and the registry of loaded plugins.
//!
//! A plugin is a directory holding a `plugin.json` manifest and a Lua entry
//! point. Loading a plugin reads and validates the manifest, resolves its
//! resource quotas, evaluates the entry point inside a fresh
//! [`enclave_sandbox::Isolate`], and registers the resulting [`Plugin`]
//! record. Exported functions keep running inside that isolate, under the
//! same quotas, every time they are called.
//!
//! # Architecture
//!
//! - [`manifest`] reads `plugin.json` and validates its structure. Quotas are
//!   resolved lazily and strictly: nothing is defaulted.
//! - [`runner`] defines the [`CodeRunner`] strategy and its Lua
//!   implementation, [`LuaRunner`].
//! - [`loader`] drives discovery, batch loading, reload, and unregistration.
//! - [`registry`] stores records keyed by name; the last load wins.
//!
//! The registry is owned by the caller and injected into the loader, so
//! several independent plugin sets can coexist in one process.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use enclave_plugins::{LuaRunner, PluginLoader, PluginRegistry};
//!
//! # fn main() -> Result<(), enclave_plugins::PluginError> {
//! let registry = Arc::new(PluginRegistry::new());
//! let loader = PluginLoader::new(LuaRunner::new(), Arc::clone(&registry));
//!
//! let greeter = loader.load_plugin(Path::new("plugins/greeter"))?;
//! let reply = greeter.call("greet", &[serde_json::json!("world")])?;
//! assert_eq!(reply, serde_json::json!("hello world"));
//! # Ok(()) }
//! ```

pub mod error;
pub mod loader;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod runner;

#[cfg(test)]
mod tests;

pub use enclave_sandbox::{ConsoleLevel, ConsoleLine, HostModule, SandboxProfile};

pub use self::error::{ErrorKind, PluginError};
pub use self::loader::{LoadFailure, LoadReport, PluginLoader};
pub use self::manifest::{
    MANIFEST_FILE_NAME, PluginManifest, PluginMetadata, Quotas, read_manifest,
};
pub use self::plugin::{
    Callable, Export, ExportSummary, ExportedFunction, Exports, Plugin, PluginSummary,
};
pub use self::registry::PluginRegistry;
pub use self::runner::{CodeRunner, LoadedCode, LuaRunner, run_sandbox};
