/// Compilation settings shared by every function compiled by an ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// The embedder routes memory faults through a trap handler. Memory
    /// accesses are only compiled inline when this is set.
    pub use_trap_handler: bool,
    /// Emit an explicit bounds check before every memory access. When
    /// disabled, out-of-bounds accesses are expected to hit a guard region.
    pub bounds_checks: bool,
    /// Emit a stack limit check at function entry.
    pub stack_checks: bool,
    /// Out-of-line code calls into runtime stubs. When disabled, traps call
    /// the testing trap callback and return from the function instead, and
    /// no stack checks are emitted.
    pub runtime_exception_support: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_trap_handler: true,
            bounds_checks: true,
            stack_checks: true,
            runtime_exception_support: true,
        }
    }
}
