//! Error type for the engine crate (`SPEC_FULL.md` §7).
//!
//! Every variant corresponds to a row in the error table: the fault
//! rows that belong to the `Hypervisor` boundary itself are wrapped
//! rather than duplicated.

use kvm_config::ConfigError;
use kvm_vm_runtime::error::HypervisorError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("tenant not found: {name}")]
    NotFound { name: String },

    #[error("registry is in the wrong phase: expected {expected}, found {actual}")]
    WrongPhase { expected: String, actual: String },

    #[error("invalid tenant configuration: {message}")]
    BadConfig { message: String },

    #[error("pattern failed to compile: {message}")]
    CompileFailed { message: String },

    #[error("guest workspace exhausted")]
    OutOfWorkspace,

    #[error("timed out waiting for a free vm")]
    ReserveTimeout,

    #[error("vm pool is shutting down")]
    PoolShutdown,

    #[error("guest run exceeded its deadline")]
    GuestTimeout,

    #[error("guest returned a {status} status")]
    GuestStatus5xx { status: u16 },

    #[error("chain of {len} invocations exceeds the configured maximum of {max}")]
    ChainTooLong { len: usize, max: usize },

    #[error("storage subsystem busy")]
    StorageBusy,

    #[error("long-lived socket donation refused: {message}")]
    DonationRefused { message: String },

    #[error("guest syscall failed: {message}")]
    GuestSyscallFailure { message: String },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
