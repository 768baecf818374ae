//! Isolate policy definition and builder helpers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use mlua::StdLib;

/// Default number of console lines retained per isolate.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 256;

/// Default number of VM instructions between deadline checks.
pub const DEFAULT_HOOK_INTERVAL: u32 = 1_000;

/// Lua standard libraries that may be opened inside an isolate.
///
/// `io`, `os`, `package`, and `debug` are deliberately absent: they are
/// replaced by trap tables that record a capability violation on access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StdLibrary {
    /// `coroutine.*`
    Coroutine,
    /// `table.*`
    Table,
    /// `string.*`
    String,
    /// `math.*`
    Math,
    /// `utf8.*`
    Utf8,
}

impl StdLibrary {
    /// Every library the isolate can open.
    pub const ALL: [Self; 5] = [
        Self::Coroutine,
        Self::Table,
        Self::String,
        Self::Math,
        Self::Utf8,
    ];

    const fn flag(self) -> StdLib {
        match self {
            Self::Coroutine => StdLib::COROUTINE,
            Self::Table => StdLib::TABLE,
            Self::String => StdLib::STRING,
            Self::Math => StdLib::MATH,
            Self::Utf8 => StdLib::UTF8,
        }
    }
}

/// Side-effect free host modules reachable through `require`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostModule {
    /// Lexical path manipulation (`require("path")`).
    Path,
    /// Hash digests (`require("crypto")`).
    Crypto,
    /// JSON encoding and decoding (`require("json")`).
    Json,
}

impl HostModule {
    /// Every host module the isolate can expose.
    pub const ALL: [Self; 3] = [Self::Path, Self::Crypto, Self::Json];

    /// Returns the name scripts pass to `require`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Crypto => "crypto",
            Self::Json => "json",
        }
    }

    /// Resolves a `require` name to a host module.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|module| module.as_str() == name)
    }
}

/// Declarative description of what code inside an isolate may reach.
///
/// The default profile opens the safe standard libraries and every host
/// module, has no module root (so only host modules can be required), keeps
/// [`DEFAULT_CONSOLE_CAPACITY`] console lines, and checks the deadline every
/// [`DEFAULT_HOOK_INTERVAL`] instructions.
///
/// ```
/// use enclave_sandbox::{HostModule, SandboxProfile};
///
/// let profile = SandboxProfile::new()
///     .with_module_root("/srv/plugins/greeter")
///     .deny_host_module(HostModule::Json);
/// assert!(!profile.allows_host_module(HostModule::Json));
/// assert!(profile.allows_host_module(HostModule::Path));
/// ```
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    std_libraries: BTreeSet<StdLibrary>,
    host_modules: BTreeSet<HostModule>,
    module_root: Option<PathBuf>,
    console_capacity: usize,
    hook_interval: u32,
}

impl SandboxProfile {
    /// Creates the default profile.
    #[must_use]
    pub fn new() -> Self {
        Self {
            std_libraries: StdLibrary::ALL.into_iter().collect(),
            host_modules: HostModule::ALL.into_iter().collect(),
            module_root: None,
            console_capacity: DEFAULT_CONSOLE_CAPACITY,
            hook_interval: DEFAULT_HOOK_INTERVAL,
        }
    }

    /// Allows `require` to load `.lua` modules from beneath `root`.
    #[must_use]
    pub fn with_module_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.module_root = Some(root.into());
        self
    }

    /// Removes a standard library from the allow-list.
    #[must_use]
    pub fn deny_std_library(mut self, library: StdLibrary) -> Self {
        self.std_libraries.remove(&library);
        self
    }

    /// Removes a host module from the allow-list.
    #[must_use]
    pub fn deny_host_module(mut self, module: HostModule) -> Self {
        self.host_modules.remove(&module);
        self
    }

    /// Overrides the number of retained console lines.
    #[must_use]
    pub const fn with_console_capacity(mut self, capacity: usize) -> Self {
        self.console_capacity = capacity;
        self
    }

    /// Overrides how many VM instructions run between deadline checks.
    ///
    /// Zero is clamped to one.
    #[must_use]
    pub fn with_hook_interval(mut self, instructions: u32) -> Self {
        self.hook_interval = instructions.max(1);
        self
    }

    /// Returns the `mlua` flags for the allowed standard libraries.
    pub(crate) fn std_lib_flags(&self) -> StdLib {
        self.std_libraries
            .iter()
            .fold(StdLib::NONE, |flags, library| flags | library.flag())
    }

    /// Returns true when the standard library may be opened.
    #[must_use]
    pub fn allows_std_library(&self, library: StdLibrary) -> bool {
        self.std_libraries.contains(&library)
    }

    /// Returns true when the host module may be required.
    #[must_use]
    pub fn allows_host_module(&self, module: HostModule) -> bool {
        self.host_modules.contains(&module)
    }

    /// Directory local modules are resolved against, if any.
    #[must_use]
    pub fn module_root(&self) -> Option<&Path> {
        self.module_root.as_deref()
    }

    /// Maximum number of retained console lines.
    #[must_use]
    pub const fn console_capacity(&self) -> usize {
        self.console_capacity
    }

    /// Instructions between deadline checks.
    #[must_use]
    pub const fn hook_interval(&self) -> u32 {
        self.hook_interval
    }
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self::new()
    }
}
