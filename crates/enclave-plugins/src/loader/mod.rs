//! Plugin discovery and loading.
//!
//! The [`PluginLoader`] ties the manifest reader, a [`CodeRunner`], and a
//! [`PluginRegistry`] together. Single-plugin operations propagate failures
//! unchanged. Batch loading logs and collects per-plugin failures so that one
//! broken plugin never prevents the others from loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::PluginError;
use crate::manifest::{MANIFEST_FILE_NAME, read_manifest};
use crate::plugin::Plugin;
use crate::registry::PluginRegistry;
use crate::runner::CodeRunner;

const LOADER_TARGET: &str = "enclave_plugins::loader";

/// A plugin directory that failed to load during a batch.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    directory: PathBuf,
    error: PluginError,
}

impl LoadFailure {
    /// Directory that was attempted.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Why it failed.
    #[must_use]
    pub const fn error(&self) -> &PluginError {
        &self.error
    }
}

/// Outcome of [`PluginLoader::load_all_plugins`].
#[derive(Debug, Default)]
pub struct LoadReport {
    loaded: Vec<Arc<Plugin>>,
    failures: Vec<LoadFailure>,
}

impl LoadReport {
    /// Plugins that loaded, in directory-name order.
    #[must_use]
    pub fn loaded(&self) -> &[Arc<Plugin>] {
        &self.loaded
    }

    /// Directories that failed, in directory-name order.
    #[must_use]
    pub fn failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    /// Returns true when every candidate directory loaded.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Consumes the report, keeping only the loaded plugins.
    #[must_use]
    pub fn into_loaded(self) -> Vec<Arc<Plugin>> {
        self.loaded
    }
}

/// Loads plugins from disk into a shared registry.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use enclave_plugins::{LuaRunner, PluginLoader, PluginRegistry};
///
/// # fn main() -> Result<(), enclave_plugins::PluginError> {
/// let registry = Arc::new(PluginRegistry::new());
/// let loader = PluginLoader::new(LuaRunner::new(), Arc::clone(&registry));
/// let report = loader.load_all_plugins(Path::new("plugins"))?;
/// assert_eq!(registry.len(), report.loaded().len());
/// # Ok(()) }
/// ```
#[derive(Debug)]
pub struct PluginLoader<R> {
    runner: R,
    registry: Arc<PluginRegistry>,
}

impl<R> PluginLoader<R> {
    /// Creates a loader that registers into `registry`.
    #[must_use]
    pub const fn new(runner: R, registry: Arc<PluginRegistry>) -> Self {
        Self { runner, registry }
    }

    /// Returns the registry plugins are loaded into.
    #[must_use]
    pub const fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Returns the code runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Removes a plugin from the registry.
    pub fn unregister(&self, name: &str) -> Option<Arc<Plugin>> {
        let removed = self.registry.unregister(name);
        if removed.is_some() {
            info!(target: LOADER_TARGET, plugin = name, "plugin unregistered");
        }
        removed
    }
}

impl<R: CodeRunner> PluginLoader<R> {
    /// Loads the plugin in `directory` and registers it.
    ///
    /// # Errors
    ///
    /// Returns the manifest, quota, or execution error unchanged. Nothing is
    /// registered on failure.
    pub fn load_plugin(&self, directory: &Path) -> Result<Arc<Plugin>, PluginError> {
        let plugin = self.build(directory)?;
        self.install(directory, &plugin);
        Ok(plugin)
    }

    /// Loads every immediate subdirectory of `root`, in name order.
    ///
    /// Entries that are not directories are skipped. Per-plugin failures are
    /// logged and reported in [`LoadReport::failures`].
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] only if `root` itself cannot be listed.
    pub fn load_all_plugins(&self, root: &Path) -> Result<LoadReport, PluginError> {
        let mut report = LoadReport::default();
        for directory in candidate_directories(root)? {
            match self.load_plugin(&directory) {
                Ok(plugin) => report.loaded.push(plugin),
                Err(error) => {
                    warn!(
                        target: LOADER_TARGET,
                        directory = %directory.display(),
                        kind = %error.kind(),
                        error = %error,
                        "skipping plugin"
                    );
                    report.failures.push(LoadFailure { directory, error });
                }
            }
        }
        info!(
            target: LOADER_TARGET,
            root = %root.display(),
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            "plugin scan complete"
        );
        Ok(report)
    }

    /// Re-reads and re-runs a registered plugin from its directory.
    ///
    /// The registry entry is replaced only once the new record is complete;
    /// on failure the previous record stays registered.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered,
    /// [`PluginError::InvalidManifest`] if the manifest now declares a
    /// different name, or any load error.
    pub fn reload(&self, name: &str) -> Result<Arc<Plugin>, PluginError> {
        let current = self
            .registry
            .get(name)
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_owned(),
            })?;
        let directory = current.manifest().base_dir().to_path_buf();
        let plugin = self.build(&directory)?;
        if plugin.name() != name {
            return Err(PluginError::InvalidManifest {
                path: directory.join(MANIFEST_FILE_NAME),
                message: format!(
                    "reload of '{name}' found a manifest named '{}'",
                    plugin.name()
                ),
            });
        }
        self.install(&directory, &plugin);
        Ok(plugin)
    }

    fn build(&self, directory: &Path) -> Result<Arc<Plugin>, PluginError> {
        let manifest = read_manifest(&directory.join(MANIFEST_FILE_NAME))?;
        // Quotas gate execution: a runner never sees an unbounded manifest.
        manifest.quotas()?;
        let code = self.runner.run(&manifest)?;
        Ok(Arc::new(Plugin::new(manifest, code)))
    }

    fn install(&self, directory: &Path, plugin: &Arc<Plugin>) {
        let replaced = self.registry.register(Arc::clone(plugin)).is_some();
        info!(
            target: LOADER_TARGET,
            plugin = plugin.name(),
            version = plugin.version(),
            directory = %directory.display(),
            exports = plugin.exports().len(),
            replaced,
            "plugin loaded"
        );
    }
}

fn candidate_directories(root: &Path) -> Result<Vec<PathBuf>, PluginError> {
    let io_error = |error| PluginError::Io {
        path: root.to_path_buf(),
        source: Arc::new(error),
    };
    let mut directories = Vec::new();
    for entry in fs::read_dir(root).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_dir() {
            directories.push(path);
        }
    }
    directories.sort();
    Ok(directories)
}
