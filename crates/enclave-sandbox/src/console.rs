//! Captured console output produced by sandboxed code.
//!
//! Scripts never write to the host's standard streams. `print` and the
//! `console.*` functions append to a bounded buffer owned by the isolate, and
//! each line is mirrored to `tracing` under [`CONSOLE_TARGET`] with the
//! isolate label attached so host and plugin logs stay distinguishable.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Tracing target used for mirrored console output.
pub const CONSOLE_TARGET: &str = "enclave_sandbox::console";

/// Severity attached to a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleLevel {
    /// `console.debug`
    Debug,
    /// `print` and `console.log` / `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

/// One captured line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleLine {
    level: ConsoleLevel,
    text: String,
}

impl ConsoleLine {
    /// Creates a console line.
    #[must_use]
    pub fn new(level: ConsoleLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }

    /// Line severity.
    #[must_use]
    pub const fn level(&self) -> ConsoleLevel {
        self.level
    }

    /// Line text.
    #[must_use]
    pub const fn text(&self) -> &str {
        self.text.as_str()
    }
}

/// Bounded ring of console lines. The oldest line is dropped when full.
#[derive(Debug)]
pub(crate) struct Console {
    label: String,
    capacity: usize,
    lines: Mutex<VecDeque<ConsoleLine>>,
}

impl Console {
    pub(crate) fn new(label: impl Into<String>, capacity: usize) -> Self {
        Self {
            label: label.into(),
            capacity,
            lines: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, level: ConsoleLevel, text: String) {
        let plugin = self.label.as_str();
        match level {
            ConsoleLevel::Debug => debug!(target: CONSOLE_TARGET, plugin, "{text}"),
            ConsoleLevel::Info => info!(target: CONSOLE_TARGET, plugin, "{text}"),
            ConsoleLevel::Warn => warn!(target: CONSOLE_TARGET, plugin, "{text}"),
            ConsoleLevel::Error => error!(target: CONSOLE_TARGET, plugin, "{text}"),
        }

        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(ConsoleLine::new(level, text));
    }

    pub(crate) fn snapshot(&self) -> Vec<ConsoleLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn drain(&self) -> Vec<ConsoleLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}
