//! Tenant registry, program instances, vm pool, invocation pipeline,
//! chain executor, storage call subsystem, live commit, and long-lived
//! socket mode (C2-C9). Built on `kvm-vm-runtime`'s hypervisor
//! abstraction, handle cache, and guest ABI (C1, C10).

pub mod chain;
pub mod error;
pub mod instance;
pub mod longlived;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod storage;

pub use chain::{Chain, Invocation};
pub use error::EngineError;
pub use instance::{ProgramInstance, ProgramInstanceInner};
pub use longlived::{LongLivedManager, FD_HANGUP_SLOT, FD_READABLE_SLOT, FD_WRITABLE_SLOT};
pub use pipeline::{Pipeline, PipelineResult};
pub use pool::{EphemeralVm, VmPool, VmState};
pub use registry::{RegistryPhase, Tenant, TenantRegistry};
pub use runtime::Runtime;
pub use storage::StorageSubsystem;
