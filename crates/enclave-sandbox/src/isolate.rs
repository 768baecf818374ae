//! A single Lua isolate with a deadline, a memory ceiling, and captured
//! console output.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use mlua::{ChunkMode, Function, Lua, LuaOptions, LuaSerdeExt, MultiValue, RegistryKey, Value};
use thiserror::Error;
use tracing::debug;

use crate::budget::ResourceBudget;
use crate::console::{Console, ConsoleLine};
use crate::deadline::DeadlineHook;
use crate::environment;
use crate::error::SandboxError;
use crate::natives;
use crate::profile::SandboxProfile;
use crate::state::IsolateState;

const ISOLATE_TARGET: &str = "enclave_sandbox::isolate";

/// Handle to a Lua function exported by an entry point.
///
/// The function stays alive in the isolate's registry for as long as the
/// handle does. Handles are only meaningful for the isolate that issued them.
#[derive(Debug)]
pub struct FunctionHandle(RegistryKey);

/// One exported value.
#[derive(Debug)]
pub enum ExportSlot {
    /// Plain data converted to JSON.
    Data(serde_json::Value),
    /// A callable function.
    Function(FunctionHandle),
}

/// Named exports returned by an entry point, ordered by name.
#[derive(Debug, Default)]
pub struct ModuleExports {
    slots: BTreeMap<String, ExportSlot>,
}

impl ModuleExports {
    /// Looks up an export by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ExportSlot> {
        self.slots.get(name)
    }

    /// Iterates over exports in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExportSlot)> {
        self.slots.iter().map(|(name, slot)| (name.as_str(), slot))
    }

    /// Number of exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when the entry point exported nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl IntoIterator for ModuleExports {
    type Item = (String, ExportSlot);
    type IntoIter = std::collections::btree_map::IntoIter<String, ExportSlot>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.into_iter()
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct ExportShapeError(String);

fn shape_error(message: impl Into<String>) -> mlua::Error {
    mlua::Error::external(ExportShapeError(message.into()))
}

/// An isolated Lua state.
///
/// Every execution entered through [`Isolate::evaluate`], [`Isolate::evaluate_file`],
/// or [`Isolate::call`] is guarded:
///
/// - an instruction hook fires every `hook_interval` VM instructions on the
///   running thread and every coroutine it resumes, and aborts the execution
///   once the CPU deadline has passed;
/// - pattern matching and the element-shifting table functions check the same
///   deadline from host code, since they never return to the VM while they
///   loop;
/// - the allocator refuses to grow past the memory ceiling;
/// - any capability violation recorded during the execution fails it, even if
///   the script caught the resulting Lua error.
///
/// The state sits behind a mutex, so executions on one isolate are
/// serialised and the isolate can be shared between threads.
#[derive(Debug)]
pub struct Isolate {
    label: String,
    lua: Mutex<Lua>,
    state: Arc<IsolateState>,
    budget: ResourceBudget,
    deadline: DeadlineHook,
}

impl Isolate {
    /// Creates an isolate for `label` with the given policy and budget.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Setup`] if the Lua state cannot be created or
    /// configured.
    pub fn new(
        label: impl Into<String>,
        profile: &SandboxProfile,
        budget: ResourceBudget,
    ) -> Result<Self, SandboxError> {
        let owned_label = label.into();
        let lua =
            Lua::new_with(profile.std_lib_flags(), LuaOptions::new()).map_err(SandboxError::Setup)?;
        let state = Arc::new(IsolateState::new(Console::new(
            owned_label.clone(),
            profile.console_capacity(),
        )));
        let deadline = DeadlineHook::new(Arc::clone(&state), profile.hook_interval());
        environment::install(&lua, profile, &state).map_err(SandboxError::Setup)?;
        deadline.install(&lua).map_err(SandboxError::Setup)?;
        natives::install(&lua, &state, budget.memory_bytes()).map_err(SandboxError::Setup)?;
        lua.set_memory_limit(budget.memory_bytes())
            .map_err(SandboxError::Setup)?;

        debug!(
            target: ISOLATE_TARGET,
            plugin = owned_label.as_str(),
            cpu_ms = budget.cpu_millis(),
            memory_bytes = budget.memory_bytes(),
            "isolate created"
        );
        Ok(Self {
            label: owned_label,
            lua: Mutex::new(lua),
            state,
            budget,
            deadline,
        })
    }

    /// Label used in logs and console mirroring.
    #[must_use]
    pub const fn label(&self) -> &str {
        self.label.as_str()
    }

    /// Budget applied to every execution.
    #[must_use]
    pub const fn budget(&self) -> ResourceBudget {
        self.budget
    }

    /// Reads and evaluates an entry point file, collecting its exports.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::EntryPoint`] when the file cannot be read, and
    /// any error [`Isolate::evaluate`] can return.
    pub fn evaluate_file(&self, path: &Path) -> Result<ModuleExports, SandboxError> {
        let source = fs::read_to_string(path).map_err(|error| SandboxError::EntryPoint {
            path: path.to_path_buf(),
            source: Arc::new(error),
        })?;
        let chunk_name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        self.evaluate(&chunk_name, &source)
    }

    /// Evaluates `source` as an entry point and collects its exports.
    ///
    /// The chunk must return a table with string keys, or nothing. Function
    /// values become [`ExportSlot::Function`]; every other value must convert
    /// to JSON.
    ///
    /// # Errors
    ///
    /// Returns the classified outcome of a failed execution, or
    /// [`SandboxError::InvalidExports`] when the returned value has the wrong
    /// shape.
    pub fn evaluate(&self, chunk_name: &str, source: &str) -> Result<ModuleExports, SandboxError> {
        let guard = self.lock();
        self.guarded(&guard, |lua| {
            let value = lua
                .load(source)
                .set_name(format!("={chunk_name}"))
                .set_mode(ChunkMode::Text)
                .eval::<Value>()?;
            collect_exports(lua, value)
        })
    }

    /// Calls an exported function with JSON arguments.
    ///
    /// Only the first return value is kept. The CPU deadline is re-armed for
    /// the call.
    ///
    /// # Errors
    ///
    /// Returns the classified outcome of a failed execution. A return value
    /// that cannot be converted to JSON is reported as
    /// [`SandboxError::Script`].
    pub fn call(
        &self,
        function: &FunctionHandle,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, SandboxError> {
        let guard = self.lock();
        self.guarded(&guard, |lua| {
            let callee: Function = lua.registry_value(&function.0)?;
            let lua_args = args
                .iter()
                .map(|arg| lua.to_value(arg))
                .collect::<mlua::Result<Vec<_>>>()?;
            let results: MultiValue = callee.call(MultiValue::from_vec(lua_args))?;
            let first = results.into_iter().next().unwrap_or(Value::Nil);
            lua.from_value(first)
        })
    }

    /// Copies the retained console lines.
    #[must_use]
    pub fn console_lines(&self) -> Vec<ConsoleLine> {
        self.state.console().snapshot()
    }

    /// Removes and returns the retained console lines.
    #[must_use]
    pub fn drain_console(&self) -> Vec<ConsoleLine> {
        self.state.console().drain()
    }

    /// Bytes currently held by the Lua allocator.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.lock().used_memory()
    }

    fn lock(&self) -> MutexGuard<'_, Lua> {
        self.lua.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guarded<'lua, T>(
        &self,
        lua: &'lua Lua,
        operation: impl FnOnce(&'lua Lua) -> mlua::Result<T>,
    ) -> Result<T, SandboxError> {
        self.state.reset();
        self.state.arm(self.budget.cpu());
        self.deadline.attach_current(lua);
        let outcome = operation(lua);
        lua.remove_hook();
        self.state.disarm();
        self.classify(outcome)
    }

    fn classify<T>(&self, outcome: mlua::Result<T>) -> Result<T, SandboxError> {
        if self.state.timed_out() {
            debug!(target: ISOLATE_TARGET, plugin = self.label.as_str(), "deadline exceeded");
            return Err(SandboxError::DeadlineExceeded {
                limit_ms: self.budget.cpu_millis(),
            });
        }
        if let Some(capability) = self.state.first_violation() {
            debug!(
                target: ISOLATE_TARGET,
                plugin = self.label.as_str(),
                capability = capability.as_str(),
                "capability denied"
            );
            return Err(SandboxError::CapabilityDenied { capability });
        }
        outcome.map_err(|error| self.classify_error(&error))
    }

    fn classify_error(&self, error: &mlua::Error) -> SandboxError {
        if is_memory_error(error) {
            return SandboxError::MemoryExhausted {
                limit_bytes: self.budget.memory_bytes(),
            };
        }
        if let Some(shape) = find_external::<ExportShapeError>(error) {
            return SandboxError::InvalidExports {
                message: shape.0.clone(),
            };
        }
        SandboxError::Script {
            message: error.to_string(),
        }
    }
}

fn collect_exports<'lua>(lua: &'lua Lua, returned: Value<'lua>) -> mlua::Result<ModuleExports> {
    let table = match returned {
        Value::Nil => return Ok(ModuleExports::default()),
        Value::Table(table) => table,
        other => {
            return Err(shape_error(format!(
                "entry point must return a table, got {}",
                other.type_name()
            )));
        }
    };

    let mut exports = ModuleExports::default();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair?;
        let key_type = key.type_name();
        let Value::String(key_text) = key else {
            return Err(shape_error(format!(
                "export names must be strings, got {key_type}"
            )));
        };
        let name = key_text.to_str()?.to_owned();
        let slot = match value {
            Value::Function(function) => {
                ExportSlot::Function(FunctionHandle(lua.create_registry_value(function)?))
            }
            other => ExportSlot::Data(lua.from_value(other).map_err(|error| {
                if is_memory_error(&error) {
                    error
                } else {
                    shape_error(format!("export '{name}' is not representable: {error}"))
                }
            })?),
        };
        exports.slots.insert(name, slot);
    }
    Ok(exports)
}

/// Walks the wrapper variants `mlua` uses for errors raised inside callbacks.
fn error_chain(error: &mlua::Error) -> impl Iterator<Item = &mlua::Error> {
    std::iter::successors(Some(error), |current| match current {
        mlua::Error::CallbackError { cause, .. }
        | mlua::Error::WithContext { cause, .. }
        | mlua::Error::BadArgument { cause, .. } => Some(cause.as_ref()),
        _ => None,
    })
}

fn is_memory_error(error: &mlua::Error) -> bool {
    error_chain(error).any(|cause| matches!(cause, mlua::Error::MemoryError(_)))
}

fn find_external<T: std::error::Error + 'static>(error: &mlua::Error) -> Option<&T> {
    error_chain(error).find_map(|cause| match cause {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<T>(),
        _ => None,
    })
}
