//! Plugin registry for loaded plugin records.
//!
//! The [`PluginRegistry`] stores loaded plugins keyed by name. It is created
//! by its owner and shared through an `Arc`; there is no process-wide
//! instance. Registering a name that already exists replaces the previous
//! record: the last load wins.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::plugin::Plugin;

#[derive(Debug, Default)]
struct Entries {
    /// Names in first-registration order.
    order: Vec<String>,
    plugins: HashMap<String, Arc<Plugin>>,
}

/// Registry of loaded plugins.
///
/// Reads may run concurrently with writes. Each write swaps a complete
/// `Arc<Plugin>`, so a reader sees either the old record or the new one.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use enclave_plugins::{
///     Exports, LoadedCode, Plugin, PluginManifest, PluginMetadata, PluginRegistry,
/// };
///
/// let registry = PluginRegistry::new();
/// let manifest = PluginManifest::new(
///     PluginMetadata::new("greeter", "1.0.0"),
///     "main.lua",
///     "/srv/plugins/greeter",
/// );
/// registry.register(Arc::new(Plugin::new(manifest, LoadedCode::new(Exports::new()))));
/// assert!(registry.get("greeter").is_some());
/// assert!(registry.get("missing").is_none());
/// ```
#[derive(Debug, Default)]
pub struct PluginRegistry {
    entries: RwLock<Entries>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a plugin, replacing any record with the same name.
    ///
    /// A replaced record keeps its position in [`PluginRegistry::get_all`].
    /// Returns the replaced record, if any.
    pub fn register(&self, plugin: Arc<Plugin>) -> Option<Arc<Plugin>> {
        let name = plugin.name().to_owned();
        let mut entries = self.write();
        let replaced = entries.plugins.insert(name.clone(), plugin);
        if replaced.is_none() {
            entries.order.push(name);
        }
        replaced
    }

    /// Looks up a plugin by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Plugin>> {
        self.read().plugins.get(name).cloned()
    }

    /// Returns every plugin in first-registration order.
    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Plugin>> {
        let entries = self.read();
        entries
            .order
            .iter()
            .filter_map(|name| entries.plugins.get(name).cloned())
            .collect()
    }

    /// Removes a plugin, returning its record.
    pub fn unregister(&self, name: &str) -> Option<Arc<Plugin>> {
        let mut entries = self.write();
        let removed = entries.plugins.remove(name);
        if removed.is_some() {
            entries.order.retain(|registered| registered != name);
        }
        removed
    }

    /// Registered names in first-registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    /// Returns the number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().plugins.len()
    }

    /// Returns `true` when no plugins are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().plugins.is_empty()
    }

    // Every write is a single map operation, so a poisoned lock still guards
    // a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
