//! Hypervisor abstraction (§4.0), Handle Cache (C1), and Guest ABI /
//! Syscall Table (C10). `kvm-engine` builds the rest of the compute
//! runtime (tenant registry, pools, pipeline, chains, storage, commit,
//! long-lived sockets) on top of what this crate exposes.

pub mod abi;
pub mod error;
pub mod handle_cache;
pub mod hypervisor;
pub mod mock;

pub use error::HypervisorError;
pub use handle_cache::HandleCache;
pub use hypervisor::{BackendResult, GuestImage, GuestRequest, Hypervisor, RunOutcome, VmHandle};
