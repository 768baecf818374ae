//! Code runners that turn a validated manifest into exports.
//!
//! The [`CodeRunner`] trait is the seam between the loader and whatever
//! isolation executes plugin code. The production implementation is
//! [`LuaRunner`], which evaluates the entry point inside a fresh
//! [`enclave_sandbox::Isolate`] per load. Test doubles implement the trait to
//! return pre-configured exports without running any code.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use enclave_sandbox::{
    ConsoleLine, ExportSlot, FunctionHandle, Isolate, ResourceBudget, SandboxError,
    SandboxProfile,
};
use serde_json::Value;
use tracing::debug;

use crate::error::PluginError;
use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest, Quotas};
use crate::plugin::{Callable, Export, ExportedFunction, Exports};

const RUNNER_TARGET: &str = "enclave_plugins::runner";

/// Result of running a plugin's entry point.
#[derive(Debug, Default)]
pub struct LoadedCode {
    exports: Exports,
    console: Vec<ConsoleLine>,
}

impl LoadedCode {
    /// Wraps an export set with no console output.
    #[must_use]
    pub const fn new(exports: Exports) -> Self {
        Self {
            exports,
            console: Vec::new(),
        }
    }

    /// Attaches console lines captured during the run.
    #[must_use]
    pub fn with_console(mut self, console: Vec<ConsoleLine>) -> Self {
        self.console = console;
        self
    }

    /// Returns the exports.
    #[must_use]
    pub const fn exports(&self) -> &Exports {
        &self.exports
    }

    /// Returns the captured console lines.
    #[must_use]
    pub fn console(&self) -> &[ConsoleLine] {
        &self.console
    }

    /// Splits into exports and console lines.
    #[must_use]
    pub fn into_parts(self) -> (Exports, Vec<ConsoleLine>) {
        (self.exports, self.console)
    }
}

/// Strategy for executing a plugin's entry point.
///
/// Implementations must resolve [`PluginManifest::quotas`] before running
/// anything and must not share mutable state between runs.
///
/// # Example
///
/// ```
/// use enclave_plugins::{CodeRunner, Export, Exports, LoadedCode, PluginError, PluginManifest};
///
/// struct FixedRunner;
///
/// impl CodeRunner for FixedRunner {
///     fn run(&self, manifest: &PluginManifest) -> Result<LoadedCode, PluginError> {
///         manifest.quotas()?;
///         let mut exports = Exports::new();
///         exports.insert("answer", Export::Value(42.into()));
///         Ok(LoadedCode::new(exports))
///     }
/// }
/// ```
pub trait CodeRunner {
    /// Executes the manifest's entry point and returns its exports.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Quota`] when quotas do not resolve, and a
    /// timeout, capability, memory, or execution error when the code fails.
    fn run(&self, manifest: &PluginManifest) -> Result<LoadedCode, PluginError>;
}

impl<R: CodeRunner + ?Sized> CodeRunner for Arc<R> {
    fn run(&self, manifest: &PluginManifest) -> Result<LoadedCode, PluginError> {
        (**self).run(manifest)
    }
}

/// Runs entry points inside a Lua isolate.
///
/// The profile is a template: each run gets a copy whose module root is the
/// plugin directory, so `require` can reach the plugin's own `.lua` files.
#[derive(Debug, Clone, Default)]
pub struct LuaRunner {
    profile: SandboxProfile,
}

impl LuaRunner {
    /// Creates a runner with the default sandbox profile.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the sandbox profile template.
    #[must_use]
    pub fn with_profile(mut self, profile: SandboxProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Returns the sandbox profile template.
    #[must_use]
    pub const fn profile(&self) -> &SandboxProfile {
        &self.profile
    }
}

impl CodeRunner for LuaRunner {
    fn run(&self, manifest: &PluginManifest) -> Result<LoadedCode, PluginError> {
        let quotas = manifest.quotas()?;
        let entry_point = resolve_entry_point(manifest)?;
        let profile = self.profile.clone().with_module_root(manifest.base_dir());
        let name = manifest.name();

        let isolate = Isolate::new(name, &profile, budget(quotas))
            .map(Arc::new)
            .map_err(|error| classify(name, quotas, error))?;
        debug!(
            target: RUNNER_TARGET,
            plugin = name,
            entry_point = %entry_point.display(),
            cpu_ms = quotas.cpu_ms(),
            mem_kb = quotas.mem_kb(),
            "evaluating entry point"
        );
        let module = isolate
            .evaluate_file(&entry_point)
            .map_err(|error| classify(name, quotas, error))?;

        let exports = module
            .into_iter()
            .map(|(export, slot)| {
                let converted = match slot {
                    ExportSlot::Data(value) => Export::Value(value),
                    ExportSlot::Function(handle) => Export::Function(ExportedFunction::new(
                        LuaFunction {
                            plugin: name.to_owned(),
                            export: export.clone(),
                            quotas,
                            isolate: Arc::clone(&isolate),
                            handle,
                        },
                    )),
                };
                (export, converted)
            })
            .collect();
        Ok(LoadedCode::new(exports).with_console(isolate.drain_console()))
    }
}

/// Runs a single manifest with the default [`LuaRunner`].
///
/// # Errors
///
/// Propagates every error from [`LuaRunner::run`] unchanged.
pub fn run_sandbox(manifest: &PluginManifest) -> Result<LoadedCode, PluginError> {
    LuaRunner::default().run(manifest)
}

/// A Lua function kept alive in its plugin's isolate.
#[derive(Debug)]
struct LuaFunction {
    plugin: String,
    export: String,
    quotas: Quotas,
    isolate: Arc<Isolate>,
    handle: FunctionHandle,
}

impl Callable for LuaFunction {
    fn call(&self, args: &[Value]) -> Result<Value, PluginError> {
        debug!(
            target: RUNNER_TARGET,
            plugin = self.plugin.as_str(),
            export = self.export.as_str(),
            "invoking export"
        );
        let outcome = self.isolate.call(&self.handle, args);
        // Lines were already mirrored to tracing; only load-time output is kept.
        drop(self.isolate.drain_console());
        outcome.map_err(|error| classify(&self.plugin, self.quotas, error))
    }
}

fn budget(quotas: Quotas) -> ResourceBudget {
    ResourceBudget::from_quota(quotas.cpu_ms(), quotas.mem_kb())
}

/// Refuses entry points that resolve outside the plugin directory once
/// symlinks are followed.
fn resolve_entry_point(manifest: &PluginManifest) -> Result<PathBuf, PluginError> {
    let candidate = manifest.entry_point_path();
    let root = fs::canonicalize(manifest.base_dir());
    let resolved = fs::canonicalize(&candidate);
    match (root, resolved) {
        (Ok(root_dir), Ok(entry)) if entry.starts_with(&root_dir) => Ok(entry),
        (Ok(_), Ok(entry)) => Err(PluginError::InvalidManifest {
            path: manifest.base_dir().join(MANIFEST_FILE_NAME),
            message: format!(
                "'entryPoint' resolves outside the plugin directory: {}",
                entry.display()
            ),
        }),
        (_, Err(error)) | (Err(error), _) => Err(PluginError::Execution {
            name: manifest.name().to_owned(),
            message: format!("cannot open entry point {}: {error}", candidate.display()),
        }),
    }
}

/// Maps sandbox failures onto the plugin error taxonomy.
pub(crate) fn classify(name: &str, quotas: Quotas, error: SandboxError) -> PluginError {
    let plugin = name.to_owned();
    match error {
        SandboxError::DeadlineExceeded { .. } => PluginError::Timeout {
            name: plugin,
            cpu_ms: quotas.cpu_ms(),
        },
        SandboxError::CapabilityDenied { capability } => PluginError::CapabilityViolation {
            name: plugin,
            capability,
        },
        SandboxError::MemoryExhausted { .. } => PluginError::MemoryLimit {
            name: plugin,
            mem_kb: quotas.mem_kb(),
        },
        SandboxError::Script { message } | SandboxError::InvalidExports { message } => {
            PluginError::Execution {
                name: plugin,
                message,
            }
        }
        other @ (SandboxError::EntryPoint { .. } | SandboxError::Setup(_)) => {
            PluginError::Execution {
                name: plugin,
                message: other.to_string(),
            }
        }
    }
}
