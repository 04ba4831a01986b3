use thiserror::Error;

/// Errors surfaced by the `Hypervisor` boundary (§4.0). Everything here
/// models a failure of the out-of-scope hypervisor primitive itself —
/// guest-level failures are reported through the syscall return value
/// (`-1`), not through this type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// No entry point is registered at the requested slot.
    #[error("no entry point registered at slot {slot}")]
    NoSuchEntry {
        /// The slot id that was looked up.
        slot: u32,
    },

    /// A guest pointer or length fell outside the VM's mapped memory.
    #[error("guest pointer out of range: addr={addr:#x} len={len}")]
    OutOfRange {
        /// The address the guest supplied.
        addr: u64,
        /// The length the guest supplied.
        len: usize,
    },

    /// The VM ran past its wall-clock deadline and was stopped.
    #[error("vm exceeded its deadline and was stopped")]
    DeadlineExceeded,

    /// The guest executed an illegal operation (bad opcode, memory
    /// violation). The VM must be destroyed, never returned to a pool.
    #[error("vm faulted: {message}")]
    Faulted {
        /// Description of the fault.
        message: String,
    },

    /// The guest attempted an operation only valid from the template
    /// VM (e.g. `wait_for_requests` from an ephemeral clone).
    #[error("operation not valid in this vm's phase: {message}")]
    WrongVmPhase {
        /// Description of the phase violation.
        message: String,
    },

    /// A `HandleCache` is already at its configured capacity (§4.1).
    #[error("handle cache is at capacity")]
    CacheFull,
}
