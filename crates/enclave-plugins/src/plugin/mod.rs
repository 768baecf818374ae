//! Loaded plugin records and their exported surface.
//!
//! A [`Plugin`] is immutable once built: the loader constructs it from a
//! validated manifest and the [`LoadedCode`] a runner produced, then hands it
//! to the registry behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use enclave_sandbox::ConsoleLine;
use serde::Serialize;
use serde_json::Value;

use crate::error::PluginError;
use crate::manifest::PluginManifest;
use crate::runner::LoadedCode;

/// Invocation strategy behind an [`ExportedFunction`].
///
/// Runners implement this for whatever isolation they provide. The call
/// must enforce the plugin's quotas itself.
pub trait Callable: Send + Sync + fmt::Debug {
    /// Invokes the function with JSON arguments and returns its result.
    ///
    /// # Errors
    ///
    /// Returns a [`PluginError`] classifying the failure.
    fn call(&self, args: &[Value]) -> Result<Value, PluginError>;
}

/// A callable export. Clones share the same underlying function.
#[derive(Debug, Clone)]
pub struct ExportedFunction(Arc<dyn Callable>);

impl ExportedFunction {
    /// Wraps a callable.
    #[must_use]
    pub fn new(callable: impl Callable + 'static) -> Self {
        Self(Arc::new(callable))
    }

    /// Invokes the function.
    ///
    /// # Errors
    ///
    /// Returns whatever the underlying [`Callable`] returns.
    pub fn call(&self, args: &[Value]) -> Result<Value, PluginError> {
        self.0.call(args)
    }
}

impl PartialEq for ExportedFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// One named member of a plugin's exported surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Export {
    /// Plain data.
    Value(Value),
    /// A function that runs inside the plugin's isolate.
    Function(ExportedFunction),
}

impl Export {
    /// Returns true for function exports.
    #[must_use]
    pub const fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    /// Returns the data of a value export.
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Function(_) => None,
        }
    }
}

/// Exports keyed and ordered by name.
///
/// # Example
///
/// ```
/// use enclave_plugins::{Export, Exports};
///
/// let exports: Exports = [(String::from("answer"), Export::Value(42.into()))]
///     .into_iter()
///     .collect();
/// assert_eq!(exports.names().collect::<Vec<_>>(), vec!["answer"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exports {
    entries: BTreeMap<String, Export>,
}

impl Exports {
    /// Creates an empty export set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an export, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, export: Export) -> Option<Export> {
        self.entries.insert(name.into(), export)
    }

    /// Looks up an export by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Export> {
        self.entries.get(name)
    }

    /// Export names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Exports in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Export)> {
        self.entries.iter().map(|(name, export)| (name.as_str(), export))
    }

    /// Number of exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is exported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Export)> for Exports {
    fn from_iter<I: IntoIterator<Item = (String, Export)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A successfully loaded plugin.
#[derive(Debug)]
pub struct Plugin {
    manifest: PluginManifest,
    exports: Exports,
    console: Vec<ConsoleLine>,
}

impl Plugin {
    /// Builds a record from a manifest and the code a runner produced.
    #[must_use]
    pub fn new(manifest: PluginManifest, code: LoadedCode) -> Self {
        let (exports, console) = code.into_parts();
        Self {
            manifest,
            exports,
            console,
        }
    }

    /// Returns the plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.manifest.name()
    }

    /// Returns the plugin version.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.manifest.version()
    }

    /// Returns the description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.manifest.description()
    }

    /// Returns the manifest the plugin was loaded from.
    #[must_use]
    pub const fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Returns the exported surface.
    #[must_use]
    pub const fn exports(&self) -> &Exports {
        &self.exports
    }

    /// Console lines printed while the entry point ran.
    #[must_use]
    pub fn console(&self) -> &[ConsoleLine] {
        &self.console
    }

    /// Invokes a function export by name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Execution`] if no function export has that
    /// name, otherwise whatever the function itself fails with.
    pub fn call(&self, export: &str, args: &[Value]) -> Result<Value, PluginError> {
        match self.exports.get(export) {
            Some(Export::Function(function)) => function.call(args),
            Some(Export::Value(_)) => Err(self.execution_error(format!(
                "export '{export}' is a value, not a function"
            ))),
            None => Err(self.execution_error(format!("no export named '{export}'"))),
        }
    }

    /// Serializable description of the plugin.
    #[must_use]
    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.name().to_owned(),
            version: self.version().to_owned(),
            description: self.description().map(str::to_owned),
            exports: self
                .exports
                .iter()
                .map(|(name, export)| ExportSummary {
                    name: name.to_owned(),
                    function: export.is_function(),
                })
                .collect(),
        }
    }

    fn execution_error(&self, message: String) -> PluginError {
        PluginError::Execution {
            name: self.name().to_owned(),
            message,
        }
    }
}

/// JSON-friendly description of a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Exports in name order.
    pub exports: Vec<ExportSummary>,
}

/// Name and shape of one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// Export name.
    pub name: String,
    /// True when the export is callable.
    pub function: bool,
}
