//! Builds the global environment sandboxed scripts see.
//!
//! Only the standard libraries allowed by the profile are opened when the Lua
//! state is created. This module then layers the host surface on top:
//!
//! - `io`, `os`, `debug`, and `package` become trap tables. Any read or write
//!   through them records a capability violation and raises an error.
//! - `load`, `loadfile`, and `dofile` become trap functions.
//! - `print` and `console.*` append to the isolate console.
//! - `require` resolves host modules and plugin-local `.lua` files only.


use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::{ChunkMode, Lua, MultiValue, Table, Value};

use crate::console::ConsoleLevel;
use crate::host_modules;
use crate::profile::{HostModule, SandboxProfile};
use crate::state::IsolateState;

/// Registry slot caching modules returned by `require`.
const LOADED_MODULES: &str = "enclave.loaded";

/// Globals replaced with trap tables.
pub(crate) const TRAPPED_LIBRARIES: [&str; 4] = ["io", "os", "debug", "package"];

/// Globals replaced with trap functions.
pub(crate) const TRAPPED_FUNCTIONS: [&str; 3] = ["load", "loadfile", "dofile"];

/// Installs traps, console capture, and the restricted `require`.
pub(crate) fn install(
    lua: &Lua,
    profile: &SandboxProfile,
    state: &Arc<IsolateState>,
) -> mlua::Result<()> {
    let globals = lua.globals();
    for library in TRAPPED_LIBRARIES {
        globals.set(library, trap_library(lua, state, library)?)?;
    }
    for function in TRAPPED_FUNCTIONS {
        let trap_state = Arc::clone(state);
        globals.set(
            function,
            lua.create_function(move |_, _args: MultiValue| -> mlua::Result<()> {
                Err(trap_state.deny(function))
            })?,
        )?;
    }
    install_console(lua, state)?;
    install_require(lua, profile, state)
}

fn trap_library<'lua>(
    lua: &'lua Lua,
    state: &Arc<IsolateState>,
    library: &'static str,
) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    let meta = lua.create_table()?;

    let read_state = Arc::clone(state);
    meta.set(
        "__index",
        lua.create_function(move |_, (_table, key): (Table, Value)| -> mlua::Result<()> {
            Err(read_state.deny(format!("{library}.{}", describe_key(&key))))
        })?,
    )?;
    let write_state = Arc::clone(state);
    meta.set(
        "__newindex",
        lua.create_function(
            move |_, (_table, key, _value): (Table, Value, Value)| -> mlua::Result<()> {
                Err(write_state.deny(format!("{library}.{}", describe_key(&key))))
            },
        )?,
    )?;
    // Stops scripts from stripping the trap with `setmetatable`.
    meta.set("__metatable", false)?;

    table.set_metatable(Some(meta));
    Ok(table)
}

fn describe_key(key: &Value<'_>) -> String {
    key.as_str()
        .map_or_else(|| key.type_name().to_owned(), str::to_owned)
}

fn install_console(lua: &Lua, state: &Arc<IsolateState>) -> mlua::Result<()> {
    let print_state = Arc::clone(state);
    lua.globals().set(
        "print",
        lua.create_function(move |_, args: MultiValue| {
            print_state.console().push(ConsoleLevel::Info, render(args)?);
            Ok(())
        })?,
    )?;

    let console = lua.create_table()?;
    let levels = [
        ("log", ConsoleLevel::Info),
        ("info", ConsoleLevel::Info),
        ("debug", ConsoleLevel::Debug),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
    ];
    for (name, level) in levels {
        let line_state = Arc::clone(state);
        console.set(
            name,
            lua.create_function(move |_, args: MultiValue| {
                line_state.console().push(level, render(args)?);
                Ok(())
            })?,
        )?;
    }
    lua.globals().set("console", console)
}

/// Joins arguments with tabs, the way the stock `print` does.
fn render(args: MultiValue<'_>) -> mlua::Result<String> {
    let parts = args
        .into_iter()
        .map(|value| match value {
            Value::String(text) => Ok(text.to_string_lossy().into_owned()),
            other => other.to_string(),
        })
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(parts.join("\t"))
}

struct RequireContext {
    root: Option<PathBuf>,
    host_modules: BTreeSet<HostModule>,
    state: Arc<IsolateState>,
}

fn install_require(
    lua: &Lua,
    profile: &SandboxProfile,
    state: &Arc<IsolateState>,
) -> mlua::Result<()> {
    lua.set_named_registry_value(LOADED_MODULES, lua.create_table()?)?;

    // A root that cannot be canonicalised leaves only host modules reachable.
    let context = RequireContext {
        root: profile
            .module_root()
            .and_then(|root| fs::canonicalize(root).ok()),
        host_modules: HostModule::ALL
            .into_iter()
            .filter(|module| profile.allows_host_module(*module))
            .collect(),
        state: Arc::clone(state),
    };
    lua.globals().set(
        "require",
        lua.create_function(move |lua, name: String| require_module(lua, &name, &context))?,
    )
}

fn require_module<'lua>(
    lua: &'lua Lua,
    name: &str,
    context: &RequireContext,
) -> mlua::Result<Value<'lua>> {
    let loaded: Table<'lua> = lua.named_registry_value(LOADED_MODULES)?;
    let cached: Value<'lua> = loaded.raw_get(name)?;
    if !cached.is_nil() {
        return Ok(cached);
    }

    let module = match HostModule::from_name(name) {
        Some(host) if context.host_modules.contains(&host) => {
            Value::Table(host_modules::create(lua, host)?)
        }
        Some(_) => return Err(context.deny(name)),
        None => {
            let path = context.resolve_local(name)?;
            let source = fs::read_to_string(&path).map_err(mlua::Error::external)?;
            lua.load(source.as_str())
                .set_name(format!("@{}", module_file_name(name)))
                .set_mode(ChunkMode::Text)
                .eval::<Value>()?
        }
    };

    let stored = if module.is_nil() {
        Value::Boolean(true)
    } else {
        module
    };
    loaded.raw_set(name, stored.clone())?;
    Ok(stored)
}

impl RequireContext {
    fn deny(&self, name: &str) -> mlua::Error {
        self.state.deny(format!("require:{name}"))
    }

    /// Maps `a.b` to `<root>/a/b.lua`, refusing anything that resolves
    /// outside the root once symlinks are followed.
    fn resolve_local(&self, name: &str) -> mlua::Result<PathBuf> {
        let Some(root) = self.root.as_deref() else {
            return Err(self.deny(name));
        };
        if !name.split('.').all(is_module_segment) {
            return Err(self.deny(name));
        }
        let candidate = root.join(module_file_name(name));
        match fs::canonicalize(&candidate) {
            Ok(resolved) if is_contained(root, &resolved) => Ok(resolved),
            _ => Err(self.deny(name)),
        }
    }
}

fn is_contained(root: &Path, resolved: &Path) -> bool {
    resolved.starts_with(root) && resolved.is_file()
}

fn module_file_name(name: &str) -> String {
    format!("{}.lua", name.replace('.', "/"))
}

/// Module path segments are restricted to `[A-Za-z0-9_-]+`.
pub(crate) fn is_module_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}
