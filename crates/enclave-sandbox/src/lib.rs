//! In-process sandbox for untrusted plugin code.
//!
//! The `enclave-sandbox` crate runs Lua source inside an [`Isolate`]: a
//! private Lua state whose reachable surface is described by a
//! [`SandboxProfile`] and whose resource use is bounded by a
//! [`ResourceBudget`].
//!
//! The isolate is intentionally restrictive:
//! - Only `string`, `table`, `math`, `utf8`, and `coroutine` are opened.
//! - `io`, `os`, `debug`, `package`, `load`, `loadfile`, and `dofile` are
//!   traps. Touching them records a capability violation that fails the
//!   execution even when the script catches the error.
//! - `require` resolves the `path`, `crypto`, and `json` host modules and
//!   `.lua` files beneath the profile's module root, nothing else.
//! - `print` and `console.*` are captured into a bounded buffer and mirrored
//!   to `tracing`.
//! - Each execution has a CPU deadline. An instruction hook enforces it on
//!   the calling thread and on every coroutine it resumes, and the pattern
//!   and table functions that loop in native code check it themselves.
//! - The Lua allocator refuses to grow past the memory ceiling, and
//!   `__gc` finalizers are refused because they run with hooks disabled.
//!
//! ```rust
//! use enclave_sandbox::{ExportSlot, Isolate, ResourceBudget, SandboxProfile};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let isolate = Isolate::new(
//!     "greeter",
//!     &SandboxProfile::new(),
//!     ResourceBudget::from_quota(500, 4096),
//! )?;
//! let exports = isolate.evaluate(
//!     "main.lua",
//!     r#"return { greet = function(name) return "hello " .. name end }"#,
//! )?;
//! let Some(ExportSlot::Function(greet)) = exports.get("greet") else {
//!     return Err("missing export".into());
//! };
//! let reply = isolate.call(greet, &[serde_json::json!("world")])?;
//! assert_eq!(reply, serde_json::json!("hello world"));
//! # Ok(()) }
//! ```

mod budget;
mod console;
mod deadline;
mod environment;
mod error;
mod host_modules;
mod isolate;
mod natives;
mod profile;
mod state;

#[cfg(test)]
mod tests;

pub use budget::ResourceBudget;
pub use console::{CONSOLE_TARGET, ConsoleLevel, ConsoleLine};
pub use error::SandboxError;
pub use isolate::{ExportSlot, FunctionHandle, Isolate, ModuleExports};
pub use profile::{
    DEFAULT_CONSOLE_CAPACITY, DEFAULT_HOOK_INTERVAL, HostModule, SandboxProfile, StdLibrary,
};
