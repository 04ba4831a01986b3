//! Invocation Pipeline (C5, `SPEC_FULL.md` §4.5).
//!
//! Five steps per request: find the tenant, reserve a VM from its
//! current `ProgramInstance`, build the guest request from `RequestCtx`,
//! run to completion or deadline, extract the result and release the
//! VM. `Chain::run` (C6) reuses `Pipeline::invoke` directly rather than
//! re-deriving these steps per chain link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kvm_core::RequestCtx;
use kvm_vm_runtime::hypervisor::{GuestRequest, RunOutcome};

use crate::error::EngineError;
use crate::registry::TenantRegistry;

#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

pub struct Pipeline;

impl Pipeline {
    /// Runs a single, non-chained invocation against `ctx`.
    pub async fn run(
        ctx: &dyn RequestCtx,
        registry: &TenantRegistry,
        tenant_name: &str,
        slot: u32,
    ) -> Result<PipelineResult, EngineError> {
        let request = GuestRequest {
            url: ctx.url().into_owned(),
            arg: ctx.arg().into_owned(),
            post: ctx.body().map(|b| (b.content_type.clone(), b.bytes.clone())),
        };
        Self::invoke(registry, tenant_name, slot, request).await
    }

    /// The shared reserve-run-release core, parameterized over an
    /// already-built `GuestRequest` so `Chain::run` can splice a prior
    /// step's output in as the next step's POST body.
    pub(crate) async fn invoke(
        registry: &TenantRegistry,
        tenant_name: &str,
        slot: u32,
        request: GuestRequest,
    ) -> Result<PipelineResult, EngineError> {
        let tenant = registry
            .find(tenant_name)
            .ok_or_else(|| EngineError::NotFound { name: tenant_name.to_string() })?;
        let instance = tenant
            .instance()
            .ok_or_else(|| EngineError::NotFound { name: tenant_name.to_string() })?;

        let timeout = Duration::from_secs_f64(tenant.config().request_timeout_seconds);
        let (inner, vm) = instance.reserve(timeout).await?;

        if let Some((_, bytes)) = &request.post {
            // Materializes the handoff through `write_input` for parity
            // with what a real hypervisor's guest-memory copy would do,
            // even though this crate's `GuestRequest` already carries
            // the bytes by value for the mock guest to read directly.
            if let Err(e) = inner.hypervisor.write_input(&vm.handle, bytes) {
                instance.release(&inner, vm, true).await;
                return Err(EngineError::from(e));
            }
        }

        let run_ctx = inner.run_context();
        let hypervisor = Arc::clone(&inner.hypervisor);
        let handle = vm.handle.clone();
        let deadline = Instant::now() + timeout;

        let outcome = tokio::task::spawn_blocking(move || {
            hypervisor.run_entry(&handle, slot, request, run_ctx, deadline)
        })
        .await
        .map_err(|e| EngineError::GuestSyscallFailure { message: e.to_string() })?;

        match outcome {
            Ok(RunOutcome::Completed(result)) => {
                instance.release(&inner, vm, false).await;
                Ok(PipelineResult {
                    status: result.status,
                    content_type: result.content_type,
                    body: result.buffers.into_iter().flatten().collect(),
                })
            }
            Ok(RunOutcome::TimedOut) => {
                instance.release(&inner, vm, true).await;
                Err(EngineError::GuestTimeout)
            }
            Err(e) => {
                instance.release(&inner, vm, true).await;
                Err(EngineError::from(e))
            }
        }
    }
}
