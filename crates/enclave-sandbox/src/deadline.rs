//! CPU deadline enforcement across every Lua thread an execution runs on.
//!
//! `mlua` dispatches hook callbacks for one thread at a time: a coroutine
//! inherits the instruction hook from its creator, but the callback ignores
//! any thread other than the one it was last attached to. The replacement
//! `coroutine.resume` and `coroutine.close` therefore re-attach the hook to
//! the coroutine before running it and back to the calling thread afterwards.
//! `coroutine.wrap` is rebuilt on top of the hooked `resume` so no path
//! reaches the native resume directly.
//!
//! A deadline error is an ordinary Lua error, so `pcall`, `xpcall`, and
//! `resume` could catch it and keep looping. Each of them re-checks the
//! deadline after the protected call returns, which makes the error stick
//! until control reaches the host.

use std::sync::Arc;

use mlua::{ChunkMode, Function, HookTriggers, Lua, MultiValue, Table, Thread, Value};

use crate::state::IsolateState;

/// `coroutine.wrap` expressed through the hooked `resume`.
const WRAP_SOURCE: &str = r"
local resume, create, error = ...
local function settle(ok, ...)
  if ok then
    return ...
  end
  error((...), 0)
end
return function(body)
  local co = create(body)
  return function(...)
    return settle(resume(co, ...))
  end
end
";

/// Installs the deadline check on Lua threads.
#[derive(Debug, Clone)]
pub(crate) struct DeadlineHook {
    state: Arc<IsolateState>,
    interval: u32,
}

impl DeadlineHook {
    pub(crate) const fn new(state: Arc<IsolateState>, interval: u32) -> Self {
        Self { state, interval }
    }

    fn triggers(&self) -> HookTriggers {
        HookTriggers::new().every_nth_instruction(self.interval)
    }

    /// Hooks the thread `lua` is currently running on.
    pub(crate) fn attach_current(&self, lua: &Lua) {
        let state = Arc::clone(&self.state);
        lua.set_hook(self.triggers(), move |_, _| state.check_deadline());
    }

    /// Hooks a coroutine about to be resumed.
    pub(crate) fn attach(&self, thread: &Thread<'_>) {
        let state = Arc::clone(&self.state);
        thread.set_hook(self.triggers(), move |_, _| state.check_deadline());
    }

    /// Replaces every base function that can catch a deadline error or run
    /// code on another thread.
    pub(crate) fn install(&self, lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        for name in ["pcall", "xpcall"] {
            let protected = self.rechecked(lua, globals.raw_get(name)?)?;
            globals.raw_set(name, protected)?;
        }
        self.install_coroutines(lua)
    }

    /// Wraps a protected-call function so a caught deadline error is raised
    /// again.
    fn rechecked<'lua>(
        &self,
        lua: &'lua Lua,
        native: Function<'lua>,
    ) -> mlua::Result<Function<'lua>> {
        let native = lua.create_registry_value(native)?;
        let state = Arc::clone(&self.state);
        lua.create_function(move |lua, args: MultiValue| {
            let function: Function = lua.registry_value(&native)?;
            let outcome = function.call::<_, MultiValue>(args)?;
            state.check_deadline()?;
            Ok(outcome)
        })
    }

    /// Replaces `coroutine.resume`, `coroutine.close`, and `coroutine.wrap`
    /// when the coroutine library is open.
    fn install_coroutines(&self, lua: &Lua) -> mlua::Result<()> {
        let Value::Table(coroutine) = lua.globals().raw_get::<_, Value>("coroutine")? else {
            return Ok(());
        };
        // `close` runs pending `__close` handlers on the coroutine's own stack.
        let close = self.hooked(lua, &coroutine, "close")?;
        coroutine.raw_set("close", close)?;
        let resume = self.hooked(lua, &coroutine, "resume")?;
        let create: Function = coroutine.raw_get("create")?;
        let error: Function = lua.globals().raw_get("error")?;
        let wrap: Function = lua
            .load(WRAP_SOURCE)
            .set_name("=coroutine.wrap")
            .set_mode(ChunkMode::Text)
            .call((resume.clone(), create, error))?;
        coroutine.raw_set("resume", resume)?;
        coroutine.raw_set("wrap", wrap)
    }

    /// Wraps a native coroutine function that runs code on its first
    /// argument's stack.
    fn hooked<'lua>(
        &self,
        lua: &'lua Lua,
        coroutine: &Table<'lua>,
        name: &'static str,
    ) -> mlua::Result<Function<'lua>> {
        let native = lua.create_registry_value(coroutine.raw_get::<_, Function>(name)?)?;
        let hook = self.clone();
        lua.create_function(move |lua, (target, args): (Value, MultiValue)| {
            let function: Function = lua.registry_value(&native)?;
            if let Value::Thread(thread) = &target {
                hook.attach(thread);
            }
            let outcome = function.call::<_, MultiValue>((target, args));
            hook.attach_current(lua);
            hook.state.check_deadline()?;
            outcome
        })
    }
}
