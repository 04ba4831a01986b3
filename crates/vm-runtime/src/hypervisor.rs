//! The out-of-scope hypervisor primitive, modeled as a trait (§4.0).
//!
//! A real deployment backs this with KVM/Firecracker-style calls
//! (create VM, map memory, set registers, run, copy to/from guest
//! memory). This crate ships only `mock::MockHypervisor`, a
//! deterministic in-process double used by the test suite and by the
//! `node` binary's demo surface.

use crate::error::HypervisorError;
use std::time::Instant;

/// Opaque handle to a VM instance. Hypervisor implementations stash
/// whatever they need behind it; callers never inspect the contents.
#[derive(Clone)]
pub struct VmHandle(std::sync::Arc<dyn std::any::Any + Send + Sync>);

impl VmHandle {
    pub fn new<T: std::any::Any + Send + Sync>(inner: T) -> Self {
        VmHandle(std::sync::Arc::new(inner))
    }

    pub fn downcast_ref<T: std::any::Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

/// Inputs handed to a guest entry point, per the guest entry contract
/// (`SPEC_FULL.md` §6): `(url, arg, optional POST body)`.
#[derive(Debug, Clone, Default)]
pub struct GuestRequest {
    pub url: String,
    pub arg: String,
    pub post: Option<(String, Vec<u8>)>,
}

/// One `{ptr, len}`-equivalent output buffer the guest wrote via
/// `return_result`. The mock hypervisor has no real guest memory, so
/// buffers are owned byte vectors rather than raw pointers.
pub type OutputBuffer = Vec<u8>;

/// The Backend Result structure (`SPEC_FULL.md` §3), as extracted by
/// the host after a run completes.
#[derive(Debug, Clone, Default)]
pub struct BackendResult {
    pub status: u16,
    pub content_type: String,
    pub buffers: Vec<OutputBuffer>,
}

impl BackendResult {
    pub fn content_length(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }
}

/// Outcome of one `Hypervisor::run_entry` call.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The guest called `return_result` and stopped cleanly.
    Completed(BackendResult),
    /// The deadline passed before the guest stopped; the VM has been
    /// signaled to stop and must be treated as `Draining`.
    TimedOut,
}

/// A guest program, as loaded from a tenant's binary image. The mock
/// hypervisor represents this as a table of entry closures rather than
/// machine code; see `mock::MockGuestImage`.
pub trait GuestImage: Send + Sync {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The out-of-scope hypervisor primitive.
pub trait Hypervisor: Send + Sync {
    /// Builds the template VM: loads the image, prepares the guest's
    /// stack/argv/env equivalent, and runs it up to its declared
    /// `wait_for_requests` point.
    fn create_template(
        &self,
        image: std::sync::Arc<dyn GuestImage>,
        main_arguments: &[String],
    ) -> Result<VmHandle, HypervisorError>;

    /// Clones the template into a fresh ephemeral VM (copy-on-write in
    /// a real hypervisor; the mock clones its closure table, which is
    /// cheap enough to stand in for the same observable behavior).
    fn fork(&self, template: &VmHandle) -> Result<VmHandle, HypervisorError>;

    /// Resets an ephemeral VM's mutable state back to the template
    /// snapshot (registers, mmap cursor, scratch) without re-forking.
    fn reset(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    /// Runs the registered entry at `slot` to completion or deadline.
    /// `run_ctx` supplies the Program-Instance-level state (shared
    /// regex cache, entry table, storage/commit callbacks) that lives
    /// above any single VM; the SMP bracket is tracked per run.
    fn run_entry(
        &self,
        vm: &VmHandle,
        slot: u32,
        request: GuestRequest,
        run_ctx: crate::abi::GuestRunContext,
        deadline: Instant,
    ) -> Result<RunOutcome, HypervisorError>;

    /// Signals a running VM to stop immediately (deadline expiry or
    /// administrative cancellation).
    fn stop(&self, vm: &VmHandle) -> Result<(), HypervisorError>;

    /// Copies `data` into the VM's address space at a freshly
    /// allocated address and returns that address, for chain handoff
    /// (§4.6).
    fn write_input(&self, vm: &VmHandle, data: &[u8]) -> Result<u64, HypervisorError>;

    /// Destroys a VM. Never returns it to any pool.
    fn destroy(&self, vm: &VmHandle) -> Result<(), HypervisorError>;
}
