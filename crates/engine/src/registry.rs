//! Tenant Registry (C2, `SPEC_FULL.md` §4.2).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use kvm_config::{TenantConfig, TenantManifest};
use kvm_vm_runtime::hypervisor::{GuestImage, Hypervisor};

use crate::error::EngineError;
use crate::instance::ProgramInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryPhase {
    Init,
    Running,
}

pub struct Tenant {
    name: String,
    config: RwLock<TenantConfig>,
    instance: RwLock<Option<Arc<ProgramInstance>>>,
}

impl Tenant {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> TenantConfig {
        self.config.read().clone()
    }

    pub fn configure(&self, patch: serde_json::Value) -> Result<(), EngineError> {
        self.config.write().merge(patch).map_err(EngineError::from)
    }

    pub fn instance(&self) -> Option<Arc<ProgramInstance>> {
        self.instance.read().clone()
    }

    pub(crate) fn install_instance(&self, inst: Arc<ProgramInstance>) {
        *self.instance.write() = Some(inst);
    }

    /// Retires the currently published instance (`invalidate_programs`,
    /// §4.2): in-flight requests holding their own `Arc` clone still
    /// run to completion; new lookups see no instance until the next
    /// `async_start`.
    pub fn retire_instance(&self) {
        if let Some(inst) = self.instance.write().take() {
            inst.shutdown();
        }
    }
}

/// `dashmap`-backed name→Tenant map, used the way `neo-network` and
/// `neo-plugins` use it for concurrent read-mostly registries, plus a
/// `parking_lot::RwLock` phase gate for configuration-time operations.
pub struct TenantRegistry {
    tenants: DashMap<String, Arc<Tenant>>,
    phase: RwLock<RegistryPhase>,
    hypervisor: Arc<dyn Hypervisor>,
}

impl TenantRegistry {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        TenantRegistry {
            tenants: DashMap::new(),
            phase: RwLock::new(RegistryPhase::Init),
            hypervisor,
        }
    }

    pub fn hypervisor(&self) -> Arc<dyn Hypervisor> {
        Arc::clone(&self.hypervisor)
    }

    pub fn phase(&self) -> RegistryPhase {
        *self.phase.read()
    }

    pub fn init_tenants(&self, manifest: &TenantManifest) -> Result<(), EngineError> {
        self.require_phase(RegistryPhase::Init)?;
        for (name, config) in &manifest.tenants {
            self.tenants.insert(
                name.clone(),
                Arc::new(Tenant {
                    name: name.clone(),
                    config: RwLock::new(config.clone()),
                    instance: RwLock::new(None),
                }),
            );
        }
        tracing::info!(count = manifest.tenants.len(), "registered tenants");
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<Tenant>> {
        self.tenants.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn configure(&self, name: &str, patch: serde_json::Value) -> Result<(), EngineError> {
        self.require_phase(RegistryPhase::Init)?;
        self.find(name)
            .ok_or_else(|| EngineError::NotFound { name: name.to_string() })?
            .configure(patch)
    }

    /// Builds the tenant's template VM on a blocking thread (it's a
    /// CPU-bound operation from the hypervisor's point of view) and
    /// publishes the resulting `ProgramInstance`.
    pub async fn async_start(&self, name: &str, image: Arc<dyn GuestImage>) -> Result<(), EngineError> {
        let tenant = self
            .find(name)
            .ok_or_else(|| EngineError::NotFound { name: name.to_string() })?;
        let hypervisor = Arc::clone(&self.hypervisor);
        let config = tenant.config();
        let tenant_name = tenant.name().to_string();

        let instance = tokio::task::spawn_blocking(move || {
            ProgramInstance::build(&tenant_name, hypervisor, image, config)
        })
        .await
        .map_err(|e| EngineError::GuestSyscallFailure { message: e.to_string() })??;

        tenant.install_instance(instance);
        *self.phase.write() = RegistryPhase::Running;
        tracing::info!(tenant = name, "tenant started");
        Ok(())
    }

    pub fn invalidate_programs(&self, pattern: &str) -> Result<usize, EngineError> {
        let re = regex::Regex::new(pattern).map_err(|e| EngineError::CompileFailed { message: e.to_string() })?;
        let mut count = 0;
        for entry in self.tenants.iter() {
            if re.is_match(entry.key()) {
                entry.value().retire_instance();
                count += 1;
            }
        }
        tracing::info!(pattern, count, "invalidated tenant programs");
        Ok(count)
    }

    pub fn foreach(&self, mut f: impl FnMut(&Tenant)) {
        for entry in self.tenants.iter() {
            f(entry.value());
        }
    }

    fn require_phase(&self, expected: RegistryPhase) -> Result<(), EngineError> {
        let actual = *self.phase.read();
        if actual != expected {
            return Err(EngineError::WrongPhase {
                expected: format!("{expected:?}"),
                actual: format!("{actual:?}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_vm_runtime::mock::{MockGuestImage, MockHypervisor};

    fn manifest() -> TenantManifest {
        TenantManifest::from_json(
            r#"{"tenants": {"basic": {"uri": "file:///bin/basic"}, "chainer": {"uri": "file:///bin/chainer"}}}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn configure_rejected_once_running() {
        let registry = TenantRegistry::new(Arc::new(MockHypervisor::new()));
        registry.init_tenants(&manifest()).unwrap();
        registry
            .async_start("basic", Arc::new(MockGuestImage::new()))
            .await
            .unwrap();
        let res = registry.configure("basic", serde_json::json!({ "max_concurrency": 4 }));
        assert!(matches!(res, Err(EngineError::WrongPhase { .. })));
    }

    #[tokio::test]
    async fn invalidate_programs_matches_by_pattern() {
        let registry = TenantRegistry::new(Arc::new(MockHypervisor::new()));
        registry.init_tenants(&manifest()).unwrap();
        registry.async_start("basic", Arc::new(MockGuestImage::new())).await.unwrap();
        registry.async_start("chainer", Arc::new(MockGuestImage::new())).await.unwrap();

        let count = registry.invalidate_programs("^chain").unwrap();
        assert_eq!(count, 1);
        assert!(registry.find("chainer").unwrap().instance().is_none());
        assert!(registry.find("basic").unwrap().instance().is_some());
    }

    #[test]
    fn find_returns_none_for_unknown_tenant() {
        let registry = TenantRegistry::new(Arc::new(MockHypervisor::new()));
        assert!(registry.find("nope").is_none());
    }
}
