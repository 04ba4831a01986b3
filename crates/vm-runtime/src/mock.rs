//! `MockHypervisor`: the only `Hypervisor` implementation this crate
//! ships. A real deployment backs the trait with KVM/Firecracker; this
//! double interprets a table of Rust closures standing in for guest
//! entry points, which is enough to exercise the full engine
//! (registry, pool, pipeline, chain, storage, commit, syscall
//! dispatch) without a real ISA or kernel module.

use crate::abi::{GuestApi, GuestCallCtx, GuestRunContext};
use crate::error::HypervisorError;
use crate::hypervisor::{BackendResult, GuestImage, GuestRequest, Hypervisor, RunOutcome, VmHandle};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One entry point: the closure a guest registers via `register_func`
/// and runs when the host invokes it for a request.
pub type MockEntryFn = Arc<dyn Fn(GuestRequest, &dyn GuestApi) + Send + Sync>;

/// A loaded guest program, mock-style: a fixed table of entry
/// closures keyed by the slot id a real guest would pass to
/// `register_func`.
pub struct MockGuestImage {
    pub entries: BTreeMap<u32, MockEntryFn>,
}

impl MockGuestImage {
    pub fn new() -> Self {
        MockGuestImage {
            entries: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, slot: u32, f: MockEntryFn) -> Self {
        self.entries.insert(slot, f);
        self
    }
}

impl Default for MockGuestImage {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestImage for MockGuestImage {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct MockVmState {
    image: Arc<MockGuestImage>,
    #[allow(dead_code)]
    main_arguments: Vec<String>,
    active_cancel: Mutex<Option<Arc<AtomicBool>>>,
}

/// Deterministic in-process stand-in for a real hypervisor.
#[derive(Default)]
pub struct MockHypervisor;

impl MockHypervisor {
    pub fn new() -> Self {
        MockHypervisor
    }

    fn state(vm: &VmHandle) -> Result<&MockVmState, HypervisorError> {
        vm.downcast_ref::<MockVmState>().ok_or_else(|| HypervisorError::Faulted {
            message: "vm handle does not belong to MockHypervisor".to_string(),
        })
    }
}

impl Hypervisor for MockHypervisor {
    fn create_template(
        &self,
        image: Arc<dyn GuestImage>,
        main_arguments: &[String],
    ) -> Result<VmHandle, HypervisorError> {
        let image = image
            .as_any()
            .downcast_ref::<MockGuestImage>()
            .ok_or_else(|| HypervisorError::Faulted {
                message: "MockHypervisor requires a MockGuestImage".to_string(),
            })?;
        // In a real hypervisor this is where the template is driven to
        // its wait_for_requests trap. The mock's entry table is ready
        // the moment it's constructed, so there's nothing further to run.
        let state = MockVmState {
            image: Arc::new(MockGuestImage {
                entries: image.entries.clone(),
            }),
            main_arguments: main_arguments.to_vec(),
            active_cancel: Mutex::new(None),
        };
        Ok(VmHandle::new(state))
    }

    fn fork(&self, template: &VmHandle) -> Result<VmHandle, HypervisorError> {
        let t = Self::state(template)?;
        let state = MockVmState {
            image: Arc::clone(&t.image),
            main_arguments: t.main_arguments.clone(),
            active_cancel: Mutex::new(None),
        };
        Ok(VmHandle::new(state))
    }

    fn reset(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        let state = Self::state(vm)?;
        *state.active_cancel.lock() = None;
        Ok(())
    }

    fn run_entry(
        &self,
        vm: &VmHandle,
        slot: u32,
        request: GuestRequest,
        run_ctx: GuestRunContext,
        deadline: Instant,
    ) -> Result<RunOutcome, HypervisorError> {
        let state = Self::state(vm)?;
        let entry = state
            .image
            .entries
            .get(&slot)
            .cloned()
            .ok_or(HypervisorError::NoSuchEntry { slot })?;

        let cancel = Arc::new(AtomicBool::new(false));
        *state.active_cancel.lock() = Some(Arc::clone(&cancel));

        let ctx = Arc::new(GuestCallCtx::from_run_context(run_ctx, Arc::clone(&cancel)));

        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let run_ctx = Arc::clone(&ctx);
        std::thread::spawn(move || {
            entry(request, run_ctx.as_ref());
            let _ = tx.send(());
        });

        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(()) => {
                let result = ctx.take_result().unwrap_or(BackendResult {
                    status: 0,
                    content_type: String::new(),
                    buffers: Vec::new(),
                });
                *state.active_cancel.lock() = None;
                Ok(RunOutcome::Completed(result))
            }
            Err(_timeout) => {
                cancel.store(true, Ordering::Release);
                Ok(RunOutcome::TimedOut)
            }
        }
    }

    fn stop(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        let state = Self::state(vm)?;
        if let Some(cancel) = state.active_cancel.lock().as_ref() {
            cancel.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn write_input(&self, _vm: &VmHandle, data: &[u8]) -> Result<u64, HypervisorError> {
        // The mock has no real guest address space; chain handoff
        // reads the previous step's bytes straight out of the
        // returned address via `mock_read_input`, keyed by this
        // synthetic, monotonically distinct address.
        let mut registry = MOCK_INPUT_REGISTRY.lock();
        registry.push(data.to_vec());
        Ok((registry.len() - 1) as u64)
    }

    fn destroy(&self, _vm: &VmHandle) -> Result<(), HypervisorError> {
        Ok(())
    }
}

/// Synthetic "guest memory" for `write_input`/chain handoff: a real
/// hypervisor maps these bytes into the next VM's address space; the
/// mock keeps them in a process-global table addressed by index.
static MOCK_INPUT_REGISTRY: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Reads back bytes written by `Hypervisor::write_input`. Test-only
/// helper mirroring what a real guest's memory read would do.
pub fn mock_read_input(addr: u64) -> Option<Vec<u8>> {
    MOCK_INPUT_REGISTRY.lock().get(addr as usize).cloned()
}

/// Builds a fresh, empty `GuestRunContext` with the given host
/// callbacks — convenience for callers (tests, and `kvm-engine`'s
/// pipeline) that don't need to share a regex cache across runs.
pub fn standalone_run_context(host: Arc<dyn crate::abi::HostCallbacks>) -> GuestRunContext {
    GuestRunContext {
        host,
        regex: Arc::new(Mutex::new(crate::handle_cache::HandleCache::new(
            crate::handle_cache::DEFAULT_CAPACITY,
        ))),
        entries: Arc::new(Mutex::new(BTreeMap::new())),
        is_template: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::HostCallbacks;
    use std::time::Duration;

    struct NoopHost;
    impl HostCallbacks for NoopHost {
        fn storage_callb(&self, _func: &str, _src: &[u8], _dst_cap: usize) -> Result<Vec<u8>, ()> {
            Ok(Vec::new())
        }
        fn storage_callv(
            &self,
            _func: &str,
            _iov: &[Vec<u8>],
            _dst_cap: usize,
        ) -> Result<Vec<u8>, ()> {
            Ok(Vec::new())
        }
        fn storage_task(&self, _func: &str, _arg: Vec<u8>) {}
        fn vmcommit(&self) -> Result<(), ()> {
            Ok(())
        }
    }

    fn echo_image() -> Arc<MockGuestImage> {
        Arc::new(MockGuestImage::new().with_entry(
            0,
            Arc::new(|req, api| {
                api.return_result("text/plain", req.arg.into_bytes(), 200);
            }),
        ))
    }

    #[test]
    fn single_invocation_returns_arg_as_body() {
        let hv = MockHypervisor::new();
        let template = hv.create_template(echo_image(), &[]).unwrap();
        let vm = hv.fork(&template).unwrap();
        let request = GuestRequest {
            url: "/".to_string(),
            arg: "hi".to_string(),
            post: None,
        };
        let outcome = hv
            .run_entry(
                &vm,
                0,
                request,
                standalone_run_context(Arc::new(NoopHost)),
                Instant::now() + Duration::from_secs(1),
            )
            .unwrap();
        match outcome {
            RunOutcome::Completed(result) => {
                assert_eq!(result.status, 200);
                assert_eq!(result.content_type, "text/plain");
                assert_eq!(result.buffers, vec![b"hi".to_vec()]);
            }
            RunOutcome::TimedOut => panic!("expected completion"),
        }
    }

    #[test]
    fn infinite_loop_guest_times_out() {
        let hv = MockHypervisor::new();
        let image = Arc::new(MockGuestImage::new().with_entry(
            0,
            Arc::new(|_req, api| {
                while !api.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }),
        ));
        let template = hv.create_template(image, &[]).unwrap();
        let vm = hv.fork(&template).unwrap();
        let start = Instant::now();
        let outcome = hv
            .run_entry(
                &vm,
                0,
                GuestRequest::default(),
                standalone_run_context(Arc::new(NoopHost)),
                Instant::now() + Duration::from_millis(100),
            )
            .unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn shared_run_context_reuses_compiled_regex_across_runs() {
        let hv = MockHypervisor::new();
        let image = Arc::new(MockGuestImage::new().with_entry(
            0,
            Arc::new(|_req, api| {
                let id = api.regex_compile(b"^[a-z]+$");
                let m = api.regex_match(id, b"abc");
                api.return_result("text/plain", vec![m as u8, id as u8], 200);
            }),
        ));
        let template = hv.create_template(image, &[]).unwrap();
        let vm1 = hv.fork(&template).unwrap();
        let vm2 = hv.fork(&template).unwrap();
        let shared = standalone_run_context(Arc::new(NoopHost));
        let shared_regex = Arc::clone(&shared.regex);
        let shared_entries = Arc::clone(&shared.entries);

        let mut handles = Vec::new();
        for (vm, host_needed) in [(vm1, true), (vm2, false)] {
            let run_ctx = GuestRunContext {
                host: Arc::new(NoopHost),
                regex: Arc::clone(&shared_regex),
                entries: Arc::clone(&shared_entries),
                is_template: false,
            };
            let _ = host_needed;
            let outcome = hv
                .run_entry(&vm, 0, GuestRequest::default(), run_ctx, Instant::now() + Duration::from_secs(1))
                .unwrap();
            handles.push(outcome);
        }
        let ids: Vec<u8> = handles
            .into_iter()
            .map(|o| match o {
                RunOutcome::Completed(r) => r.buffers[0][1],
                RunOutcome::TimedOut => panic!("expected completion"),
            })
            .collect();
        assert_eq!(ids[0], ids[1], "same compiled pattern must reuse the same handle");
    }

    #[test]
    fn write_input_round_trips_through_mock_registry() {
        let hv = MockHypervisor::new();
        let template = hv.create_template(echo_image(), &[]).unwrap();
        let vm = hv.fork(&template).unwrap();
        let addr = hv.write_input(&vm, b"chained-bytes").unwrap();
        assert_eq!(mock_read_input(addr).unwrap(), b"chained-bytes");
    }
}
