//! Storage Call Subsystem (C7, `SPEC_FULL.md` §4.7).
//!
//! One storage `VmHandle` per Program Instance, forked from the same
//! guest image as the tenant's program (this crate ships no separate
//! storage-binary loader — specific guest programs are illustrative
//! only, §1). `storage_callb`/`storage_callv` run on whatever thread
//! the guest's own worker thread happens to be — a bare `std::thread`
//! spawned by the hypervisor, with no tokio context of its own — so the
//! round trip is plain synchronous code behind a `parking_lot::Mutex`,
//! never `tokio::sync::Mutex`/`spawn_blocking`/`block_on`.
//! `async_storage_call` enqueues onto an unbounded channel drained by
//! one dedicated tokio task (which does have runtime context, so it
//! hops onto a blocking thread via `spawn_blocking` to run the same
//! synchronous round trip); queued tasks are FIFO among themselves but
//! unordered relative to concurrent synchronous calls arriving from
//! other VMs (§9 Open Question (i), resolved in `SPEC_FULL.md` §4.7).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kvm_vm_runtime::abi::{GuestRunContext, HostCallbacks};
use kvm_vm_runtime::hypervisor::{GuestRequest, Hypervisor, RunOutcome, VmHandle};
use kvm_vm_runtime::mock::standalone_run_context;

use crate::error::EngineError;

/// The entry slot a storage-capable guest registers its handler at.
/// Fixed by convention rather than negotiated, since this crate's mock
/// guests are illustrative.
const STORAGE_ENTRY_SLOT: u32 = 0;
const STORAGE_RUN_TIMEOUT: Duration = Duration::from_secs(5);

/// `HostCallbacks` the storage VM's own run is given. It never issues
/// nested storage calls or commits, so every hook is a hard refusal.
struct StorageVmHost;

impl HostCallbacks for StorageVmHost {
    fn storage_callb(&self, _func: &str, _src: &[u8], _dst_cap: usize) -> Result<Vec<u8>, ()> {
        Err(())
    }
    fn storage_callv(&self, _func: &str, _iov: &[Vec<u8>], _dst_cap: usize) -> Result<Vec<u8>, ()> {
        Err(())
    }
    fn storage_task(&self, _func: &str, _arg: Vec<u8>) {}
    fn vmcommit(&self) -> Result<(), ()> {
        Err(())
    }
}

struct StorageTask {
    func: String,
    arg: Vec<u8>,
}

pub struct StorageSubsystem {
    hypervisor: Arc<dyn Hypervisor>,
    vm: Mutex<VmHandle>,
    task_tx: tokio::sync::mpsc::UnboundedSender<StorageTask>,
}

impl StorageSubsystem {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, vm: VmHandle) -> Arc<Self> {
        let (task_tx, mut task_rx) = tokio::sync::mpsc::unbounded_channel::<StorageTask>();
        let subsystem = Arc::new(StorageSubsystem {
            hypervisor,
            vm: Mutex::new(vm),
            task_tx,
        });

        // This task runs inside the tokio runtime (it was spawned from
        // one), so unlike the guest worker thread it's safe to hop onto
        // a blocking thread for the run itself.
        let worker = Arc::clone(&subsystem);
        tokio::spawn(async move {
            while let Some(task) = task_rx.recv().await {
                let worker = Arc::clone(&worker);
                let result = tokio::task::spawn_blocking(move || worker.run_entry_sync(&task.func, task.arg, 0)).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => tracing::warn!(func = %task.func, error = %err, "async storage task failed"),
                    Err(join_err) => tracing::warn!(func = %task.func, error = %join_err, "async storage task panicked"),
                }
            }
        });

        subsystem
    }

    /// Synchronous storage round trip. Safe to call from any thread,
    /// including the bare `std::thread` the hypervisor runs a guest's
    /// worker closure on — this is `storage_callb`/`storage_callv`'s
    /// only entry point, so it must never depend on a tokio context.
    pub fn call_b(&self, func: &str, src: &[u8], dst_cap: usize) -> Result<Vec<u8>, EngineError> {
        self.run_entry_sync(func, src.to_vec(), dst_cap)
    }

    pub fn call_v(&self, func: &str, iov: &[Vec<u8>], dst_cap: usize) -> Result<Vec<u8>, EngineError> {
        // The mock guest has no vectored read path distinct from a
        // single buffer; flatten here, matching how a real storage
        // VM would scatter-gather the iovec into one contiguous copy.
        let flattened: Vec<u8> = iov.iter().flatten().copied().collect();
        self.run_entry_sync(func, flattened, dst_cap)
    }

    pub fn spawn_task(&self, func: String, arg: Vec<u8>) {
        let _ = self.task_tx.send(StorageTask { func, arg });
    }

    /// Holds the storage VM's lock for the full duration of the guest
    /// run, which is what actually serializes storage calls against
    /// each other (§9 Open Question (i)).
    fn run_entry_sync(&self, func: &str, src: Vec<u8>, dst_cap: usize) -> Result<Vec<u8>, EngineError> {
        let guard = self.vm.lock();
        let request = GuestRequest {
            url: "storage".to_string(),
            arg: func.to_string(),
            post: Some(("application/octet-stream".to_string(), src)),
        };
        let run_ctx: GuestRunContext = standalone_run_context(Arc::new(StorageVmHost));
        let deadline = Instant::now() + STORAGE_RUN_TIMEOUT;

        let outcome = self.hypervisor.run_entry(&guard, STORAGE_ENTRY_SLOT, request, run_ctx, deadline)?;
        drop(guard);

        match outcome {
            RunOutcome::Completed(result) => {
                let mut bytes: Vec<u8> = result.buffers.into_iter().flatten().collect();
                if dst_cap > 0 {
                    bytes.truncate(dst_cap);
                }
                Ok(bytes)
            }
            RunOutcome::TimedOut => Err(EngineError::GuestTimeout),
        }
    }
}
