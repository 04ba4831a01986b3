//! Program Instance (C3, `SPEC_FULL.md` §4.3) and Live Commit (C8,
//! §4.8, folded into this module per the component table).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex::bytes::Regex;
use uuid::Uuid;

use kvm_config::TenantConfig;
use kvm_vm_runtime::abi::{GuestRunContext, HostCallbacks};
use kvm_vm_runtime::handle_cache::{HandleCache, DEFAULT_CAPACITY};
use kvm_vm_runtime::hypervisor::{GuestImage, Hypervisor};

use crate::error::EngineError;
use crate::longlived::LongLivedManager;
use crate::pool::{EphemeralVm, VmPool};
use crate::storage::StorageSubsystem;

/// Program-Instance-level state published behind the `ArcSwap` a
/// commit replaces wholesale. In-flight requests hold their own
/// `Arc` clone taken at reservation time, so a commit never disturbs
/// them mid-run.
pub struct ProgramInstanceInner {
    pub generation: Uuid,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub pool: VmPool,
    pub regex: Arc<Mutex<HandleCache<Regex>>>,
    pub entries: Arc<Mutex<BTreeMap<u32, u64>>>,
    pub storage: Arc<StorageSubsystem>,
    /// The dedicated long-lived manager thread this instance owns
    /// (§4.9): one per Program Instance, dispatching donated fd events
    /// into the same long-lived VM for as long as this generation is
    /// published.
    pub longlived: Arc<LongLivedManager>,
    pub config: TenantConfig,
}

/// Builds the `GuestRunContext` shared by every run against one
/// Program Instance generation: the regex cache and entry table belong
/// to the instance, not any one VM, and the host callbacks route
/// storage/commit syscalls back into this instance's own subsystems.
/// Free function rather than a method so `build_inner` can call it
/// before a `ProgramInstanceInner` exists to hand to the long-lived
/// manager it also constructs.
fn build_run_context(
    storage: &Arc<StorageSubsystem>,
    storage_enabled: bool,
    regex: &Arc<Mutex<HandleCache<Regex>>>,
    entries: &Arc<Mutex<BTreeMap<u32, u64>>>,
) -> GuestRunContext {
    GuestRunContext {
        host: Arc::new(EngineHost {
            storage: Arc::clone(storage),
            storage_enabled,
        }),
        regex: Arc::clone(regex),
        entries: Arc::clone(entries),
        is_template: false,
    }
}

impl ProgramInstanceInner {
    pub fn run_context(&self) -> GuestRunContext {
        build_run_context(&self.storage, self.config.storage_enabled, &self.regex, &self.entries)
    }
}

/// Bridges the typed `GuestApi` syscalls that need Program-Instance
/// state (storage, commit) back to this instance's subsystems. The
/// guest's worker thread is a bare `std::thread` with no tokio context
/// (`Hypervisor::run_entry` spawns it directly), so these hooks call
/// straight into `StorageSubsystem`'s synchronous, `parking_lot`-backed
/// round trip rather than bridging into async code.
struct EngineHost {
    storage: Arc<StorageSubsystem>,
    storage_enabled: bool,
}

impl HostCallbacks for EngineHost {
    fn storage_callb(&self, func: &str, src: &[u8], dst_cap: usize) -> Result<Vec<u8>, ()> {
        if !self.storage_enabled {
            return Err(());
        }
        self.storage.call_b(func, src, dst_cap).map_err(|_| ())
    }

    fn storage_callv(&self, func: &str, iov: &[Vec<u8>], dst_cap: usize) -> Result<Vec<u8>, ()> {
        if !self.storage_enabled {
            return Err(());
        }
        self.storage.call_v(func, iov, dst_cap).map_err(|_| ())
    }

    fn storage_task(&self, func: &str, arg: Vec<u8>) {
        if self.storage_enabled {
            self.storage.spawn_task(func.to_string(), arg);
        }
    }

    fn vmcommit(&self) -> Result<(), ()> {
        // The actual swap lives in `ProgramInstance::commit`, called by
        // the registry once the new template has finished building;
        // this hook only needs to acknowledge the guest's linearization
        // point (§4.8). An error here would tell the caller to keep the
        // old instance published, but nothing in this crate's mock
        // guests fails it.
        Ok(())
    }
}

pub struct ProgramInstance {
    name: String,
    inner: ArcSwap<ProgramInstanceInner>,
}

impl ProgramInstance {
    pub fn build(name: &str, hypervisor: Arc<dyn Hypervisor>, image: Arc<dyn GuestImage>, config: TenantConfig) -> Result<Arc<Self>, EngineError> {
        let inner = Self::build_inner(&hypervisor, image, config, None)?;
        Ok(Arc::new(ProgramInstance {
            name: name.to_string(),
            inner: ArcSwap::from_pointee(inner),
        }))
    }

    fn build_inner(
        hypervisor: &Arc<dyn Hypervisor>,
        image: Arc<dyn GuestImage>,
        config: TenantConfig,
        loaned_regex: Option<HandleCache<Regex>>,
    ) -> Result<ProgramInstanceInner, EngineError> {
        let template = hypervisor.create_template(Arc::clone(&image), &config.main_arguments)?;
        let pool = VmPool::new(Arc::clone(hypervisor), template, config.max_concurrency);

        // The mock guest has no distinct storage binary (§1: specific
        // guest programs are illustrative only), so the storage VM is
        // forked from the same image the tenant program uses.
        let storage_template = hypervisor.create_template(Arc::clone(&image), &[])?;
        let storage_vm = hypervisor.fork(&storage_template)?;
        let storage = StorageSubsystem::new(Arc::clone(hypervisor), storage_vm);

        let regex = Arc::new(Mutex::new(loaned_regex.unwrap_or_else(|| HandleCache::new(DEFAULT_CAPACITY))));
        let entries = Arc::new(Mutex::new(BTreeMap::new()));
        let run_ctx = build_run_context(&storage, config.storage_enabled, &regex, &entries);

        // One long-lived VM per Program Instance (§4.9), forked from
        // the same image as the tenant's ordinary program for the same
        // reason the storage VM is: this crate ships no separate
        // long-lived binary loader.
        let longlived_template = hypervisor.create_template(Arc::clone(&image), &[])?;
        let longlived_vm = hypervisor.fork(&longlived_template)?;
        let longlived = Arc::new(LongLivedManager::spawn(Arc::clone(hypervisor), longlived_vm, run_ctx)?);

        Ok(ProgramInstanceInner {
            generation: Uuid::new_v4(),
            hypervisor: Arc::clone(hypervisor),
            pool,
            regex,
            entries,
            storage,
            longlived,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> Arc<ProgramInstanceInner> {
        self.inner.load_full()
    }

    pub fn generation(&self) -> Uuid {
        self.inner.load().generation
    }

    pub async fn reserve(&self, timeout: Duration) -> Result<(Arc<ProgramInstanceInner>, EphemeralVm), EngineError> {
        let inner = self.current();
        let vm = inner.pool.reserve(timeout).await?;
        Ok((inner, vm))
    }

    pub async fn release(&self, inner: &Arc<ProgramInstanceInner>, vm: EphemeralVm, draining: bool) {
        inner.pool.release(vm, draining).await;
    }

    /// Live commit (C8, §4.8). Builds a fresh instance from `image`,
    /// loaning the outgoing instance's compiled regex cache so
    /// previously-seen patterns don't need recompiling, then
    /// atomically swaps the published pointer. All-or-nothing: if
    /// building the new instance fails, the old one stays published.
    pub fn commit(&self, hypervisor: Arc<dyn Hypervisor>, image: Arc<dyn GuestImage>, config: TenantConfig) -> Result<Uuid, EngineError> {
        let old = self.current();
        let loaned = old.regex.lock().loan_from();
        let new_inner = Self::build_inner(&hypervisor, image, config, Some(loaned))?;
        let generation = new_inner.generation;
        self.inner.store(Arc::new(new_inner));
        tracing::info!(tenant = %self.name, %generation, "committed new program instance");
        Ok(generation)
    }

    pub fn shutdown(&self) {
        self.current().pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_vm_runtime::mock::{MockGuestImage, MockHypervisor};

    fn config() -> TenantConfig {
        serde_json::from_value(serde_json::json!({ "uri": "file:///bin/basic" })).unwrap()
    }

    fn echo_image() -> Arc<MockGuestImage> {
        Arc::new(MockGuestImage::new().with_entry(
            0,
            Arc::new(|req, api| api.return_result("text/plain", req.arg.into_bytes(), 200)),
        ))
    }

    #[tokio::test]
    async fn commit_preserves_compiled_regex_handles() {
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let instance = ProgramInstance::build("basic", Arc::clone(&hv), echo_image(), config()).unwrap();

        let idx = {
            let inner = instance.current();
            let mut cache = inner.regex.lock();
            cache.manage(regex::bytes::Regex::new("^a+$").unwrap(), 0xABCD).unwrap()
        };

        let old_generation = instance.generation();
        let new_generation = instance
            .commit(Arc::clone(&hv), echo_image(), config())
            .unwrap();
        assert_ne!(old_generation, new_generation);

        let inner = instance.current();
        assert!(inner.regex.lock().get(idx).is_some(), "loaned cache must retain prior handles");
    }

    #[tokio::test]
    async fn reserve_and_release_round_trip() {
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let instance = ProgramInstance::build("basic", hv, echo_image(), config()).unwrap();
        let (inner, vm) = instance.reserve(Duration::from_millis(100)).await.unwrap();
        assert_eq!(inner.pool.outstanding(), 1);
        instance.release(&inner, vm, false).await;
        assert_eq!(inner.pool.outstanding(), 0);
    }
}
