//! Resource budgets applied to a single execution.

use std::time::Duration;

/// CPU-time and memory ceilings for one isolate.
///
/// The CPU ceiling is a wall-clock deadline re-armed for every execution. The
/// memory ceiling is applied to the Lua allocator for the isolate's lifetime.
///
/// ```
/// use std::time::Duration;
/// use enclave_sandbox::ResourceBudget;
///
/// let budget = ResourceBudget::from_quota(500, 64);
/// assert_eq!(budget.cpu(), Duration::from_millis(500));
/// assert_eq!(budget.memory_bytes(), 64 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    cpu: Duration,
    memory_bytes: usize,
}

impl ResourceBudget {
    /// Creates a budget from explicit values.
    #[must_use]
    pub const fn new(cpu: Duration, memory_bytes: usize) -> Self {
        Self { cpu, memory_bytes }
    }

    /// Creates a budget from manifest units: milliseconds and kilobytes.
    ///
    /// Memory saturates at `usize::MAX` on overflow.
    #[must_use]
    pub fn from_quota(cpu_ms: u64, mem_kb: u64) -> Self {
        let memory_bytes = usize::try_from(mem_kb.saturating_mul(1024)).unwrap_or(usize::MAX);
        Self::new(Duration::from_millis(cpu_ms), memory_bytes)
    }

    /// CPU-time ceiling per execution.
    #[must_use]
    pub const fn cpu(&self) -> Duration {
        self.cpu
    }

    /// CPU-time ceiling in whole milliseconds.
    #[must_use]
    pub fn cpu_millis(&self) -> u64 {
        u64::try_from(self.cpu.as_millis()).unwrap_or(u64::MAX)
    }

    /// Memory ceiling in bytes.
    #[must_use]
    pub const fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }
}
