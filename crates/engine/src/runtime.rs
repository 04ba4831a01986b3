//! Top-level facade (`SPEC_FULL.md` §6). The host's configuration
//! language (VCL) is out of scope (§1) — this crate does not parse
//! it — but the handful of surface operations a VCL `vcl_init`/
//! `vcl_recv` would call through to are exposed here as plain async
//! methods, matching how `neo-node` wires its RPC surface onto a thin
//! facade over the underlying subsystems.

use std::sync::Arc;

use kvm_config::TenantManifest;
use kvm_core::RequestCtx;
use kvm_vm_runtime::hypervisor::{GuestImage, Hypervisor};

use crate::error::EngineError;
use crate::instance::ProgramInstance;
use crate::pipeline::{Pipeline, PipelineResult};
use crate::registry::{Tenant, TenantRegistry};

pub struct Runtime {
    registry: TenantRegistry,
}

impl Runtime {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Runtime {
            registry: TenantRegistry::new(hypervisor),
        }
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// `library(uri)`: registers a tenant manifest. This crate doesn't
    /// implement URI fetching (that's the host proxy's job); callers
    /// pass the already-fetched JSON text.
    pub fn library(&self, manifest_json: &str) -> Result<(), EngineError> {
        let manifest = TenantManifest::from_json(manifest_json)?;
        self.registry.init_tenants(&manifest)
    }

    /// `init_self_requests()`: acknowledges that the proxy may route
    /// requests back into itself for chained tenants. Nothing to set
    /// up on this side beyond logging the intent — chaining (C6)
    /// already runs in-process.
    pub fn init_self_requests(&self) {
        tracing::debug!("self-requests enabled for chained invocations");
    }

    pub fn configure(&self, tenant: &str, patch: serde_json::Value) -> Result<(), EngineError> {
        self.registry.configure(tenant, patch)
    }

    /// `main_arguments(tenant, args)`: sets the argv a future
    /// `start`/`async_start` template build will pass to the guest.
    pub fn main_arguments(&self, tenant: &str, args: Vec<String>) -> Result<(), EngineError> {
        self.registry.configure(tenant, serde_json::json!({ "main_arguments": args }))
    }

    pub async fn start(&self, tenant: &str, image: Arc<dyn GuestImage>) -> Result<(), EngineError> {
        self.registry.async_start(tenant, image).await
    }

    pub fn invalidate_programs(&self, pattern: &str) -> Result<usize, EngineError> {
        self.registry.invalidate_programs(pattern)
    }

    pub fn program(&self, tenant: &str) -> Option<Arc<ProgramInstance>> {
        self.registry.find(tenant).and_then(|t| t.instance())
    }

    /// `to_string()`: an admin-facing dump of tenant names and whether
    /// each currently has a published program instance.
    pub fn to_string(&self) -> String {
        let mut lines = Vec::new();
        self.registry.foreach(|tenant: &Tenant| {
            let state = if tenant.instance().is_some() { "running" } else { "stopped" };
            lines.push(format!("{}: {state}", tenant.name()));
        });
        lines.sort();
        lines.join("\n")
    }

    /// `synth(...)`: synthesizes a response by running a tenant's
    /// program directly against `ctx`, without going through a chain.
    pub async fn synth(&self, tenant: &str, slot: u32, ctx: &dyn RequestCtx) -> Result<PipelineResult, EngineError> {
        Pipeline::run(ctx, &self.registry, tenant, slot).await
    }

    /// `steal()`: hands the caller the currently published instance
    /// directly, bypassing the pipeline — used when the host wants to
    /// set up long-lived socket donation (C9) against a specific
    /// instance rather than through a per-request reservation.
    pub fn steal(&self, tenant: &str) -> Option<Arc<ProgramInstance>> {
        self.program(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_vm_runtime::mock::{MockGuestImage, MockHypervisor};

    #[tokio::test]
    async fn library_then_start_publishes_a_running_tenant() {
        let rt = Runtime::new(Arc::new(MockHypervisor::new()));
        rt.library(r#"{"tenants": {"basic": {"uri": "file:///bin/basic"}}}"#).unwrap();
        rt.start("basic", Arc::new(MockGuestImage::new())).await.unwrap();
        assert_eq!(rt.to_string(), "basic: running");
        assert!(rt.program("basic").is_some());
    }

    #[tokio::test]
    async fn steal_mirrors_program_lookup() {
        let rt = Runtime::new(Arc::new(MockHypervisor::new()));
        rt.library(r#"{"tenants": {"basic": {"uri": "file:///bin/basic"}}}"#).unwrap();
        rt.start("basic", Arc::new(MockGuestImage::new())).await.unwrap();
        assert!(rt.steal("basic").is_some());
        assert!(rt.steal("ghost").is_none());
    }
}
