//! Environment helpers shared by the configuration tests.

use std::ffi::{OsStr, OsString};
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Variables the loader reads; cleared while a [`EnvScope`] is alive.
const CONFIG_VARIABLES: &[&str] = &[
    "ENCLAVE_CONFIG_PATH",
    "ENCLAVE_PLUGINS_DIR",
    "ENCLAVE_LOG_FILTER",
    "ENCLAVE_LOG_FORMAT",
];

/// Serialises environment mutation and restores every touched variable.
pub struct EnvScope {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvScope {
    /// Locks the environment and clears the loader's variables.
    pub fn new() -> Self {
        let guard = ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scope = Self {
            previous: Vec::new(),
            _guard: guard,
        };
        for key in CONFIG_VARIABLES {
            scope.remember(key);
            // Mutation is serialised by `ENV_MUTEX` and undone in `Drop`.
            unsafe { std::env::remove_var(key) };
        }
        scope
    }

    /// Sets `key` for the lifetime of the scope.
    pub fn set(&mut self, key: &str, value: impl AsRef<OsStr>) {
        self.remember(key);
        unsafe { std::env::set_var(key, value) };
    }

    fn remember(&mut self, key: &str) {
        self.previous
            .push((key.to_owned(), std::env::var_os(key)));
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        while let Some((key, value)) = self.previous.pop() {
            match value {
                Some(os_value) => unsafe { std::env::set_var(&key, os_value) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }
}
