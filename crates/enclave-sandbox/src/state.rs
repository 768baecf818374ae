//! Per-isolate bookkeeping shared with Lua callbacks and the deadline hook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::console::Console;

/// Message raised inside Lua once the deadline has passed.
pub(crate) const DEADLINE_MESSAGE: &str = "execution deadline exceeded";

/// State observed across an execution.
///
/// Both flags are sticky for the duration of one execution: a script that
/// catches the deadline or a capability error with `pcall` is still failed
/// once control returns to the host.
#[derive(Debug)]
pub(crate) struct IsolateState {
    timed_out: AtomicBool,
    deadline: Mutex<Option<Instant>>,
    violations: Mutex<Vec<String>>,
    console: Console,
}

impl IsolateState {
    pub(crate) fn new(console: Console) -> Self {
        Self {
            timed_out: AtomicBool::new(false),
            deadline: Mutex::new(None),
            violations: Mutex::new(Vec::new()),
            console,
        }
    }

    /// Clears the sticky flags before a new execution.
    pub(crate) fn reset(&self) {
        self.timed_out.store(false, Ordering::SeqCst);
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Starts the clock for an execution. An unrepresentable deadline never
    /// expires.
    pub(crate) fn arm(&self, budget: Duration) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) =
            Instant::now().checked_add(budget);
    }

    pub(crate) fn disarm(&self) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Fails once the armed deadline has passed, and keeps failing until the
    /// next [`IsolateState::reset`].
    pub(crate) fn check_deadline(&self) -> mlua::Result<()> {
        let deadline = *self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = deadline.is_some_and(|limit| Instant::now() >= limit);
        if self.timed_out() || expired {
            self.mark_timed_out();
            return Err(mlua::Error::runtime(DEADLINE_MESSAGE));
        }
        Ok(())
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Records a denied capability and returns the error to raise in Lua.
    pub(crate) fn deny(&self, capability: impl Into<String>) -> mlua::Error {
        let denied = capability.into();
        let message = format!("access to '{denied}' is not permitted inside the sandbox");
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(denied);
        mlua::Error::runtime(message)
    }

    pub(crate) fn first_violation(&self) -> Option<String> {
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    pub(crate) const fn console(&self) -> &Console {
        &self.console
    }
}
