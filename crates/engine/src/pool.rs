//! VM Pool & Reservation (C4, `SPEC_FULL.md` §4.4).
//!
//! The idle stack is LIFO (`Vec::pop`/`push`) so a hot pool reuses the
//! most recently released VM first, preferring a simple `Vec`-backed
//! stack over a deque when ordering beyond LIFO isn't required.
//! Outstanding count is a `CAS` loop rather than
//! lock-then-check so two concurrent `reserve` calls can never both
//! observe room for the last slot and overshoot `max_concurrency`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvm_vm_runtime::hypervisor::{Hypervisor, VmHandle};

use crate::error::EngineError;

/// Lifecycle state of one ephemeral VM (`SPEC_FULL.md` §4.4). Tracked
/// for observability; the pool's `Vec` membership (idle vs. held by a
/// caller) is what actually enforces the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Idle,
    Reserved,
    Running,
    Draining,
}

pub struct EphemeralVm {
    pub handle: VmHandle,
    pub state: VmState,
}

pub struct VmPool {
    hypervisor: Arc<dyn Hypervisor>,
    template: VmHandle,
    idle: tokio::sync::Mutex<Vec<EphemeralVm>>,
    notify: tokio::sync::Notify,
    outstanding: AtomicUsize,
    max_concurrency: usize,
    shutdown: AtomicBool,
}

impl VmPool {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, template: VmHandle, max_concurrency: usize) -> Self {
        VmPool {
            hypervisor,
            template,
            idle: tokio::sync::Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
            outstanding: AtomicUsize::new(0),
            max_concurrency,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Reserves an idle VM, forking a new one if under
    /// `max_concurrency`, or blocks until one frees up or `timeout`
    /// elapses (`SPEC_FULL.md` §4.4).
    pub async fn reserve(&self, timeout: Duration) -> Result<EphemeralVm, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(EngineError::PoolShutdown);
            }

            if let Some(mut vm) = self.idle.lock().await.pop() {
                vm.state = VmState::Reserved;
                self.outstanding.fetch_add(1, Ordering::AcqRel);
                return Ok(vm);
            }

            if let Some(vm) = self.try_fork()? {
                return Ok(vm);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::ReserveTimeout);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Err(EngineError::ReserveTimeout),
            }
        }
    }

    /// Claims a fresh outstanding slot (via CAS, so two concurrent
    /// callers can never both claim the last one) and forks into it
    /// directly, handing the vm straight back rather than round
    /// tripping it through the idle stack. Returns `Ok(None)` if the
    /// pool is already at `max_concurrency`.
    fn try_fork(&self) -> Result<Option<EphemeralVm>, EngineError> {
        loop {
            let current = self.outstanding.load(Ordering::Acquire);
            if current >= self.max_concurrency {
                return Ok(None);
            }
            if self
                .outstanding
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return match self.hypervisor.fork(&self.template) {
                    Ok(handle) => Ok(Some(EphemeralVm {
                        handle,
                        state: VmState::Reserved,
                    })),
                    Err(e) => {
                        self.outstanding.fetch_sub(1, Ordering::AcqRel);
                        Err(EngineError::from(e))
                    }
                };
            }
        }
    }

    /// Releases a vm back to the pool: resets it to template state and
    /// pushes it onto the idle stack, or destroys it outright if the
    /// caller is marking it `Draining` (timeout, fault).
    pub async fn release(&self, mut vm: EphemeralVm, draining: bool) {
        if draining {
            vm.state = VmState::Draining;
            let _ = self.hypervisor.destroy(&vm.handle);
        } else if self.hypervisor.reset(&vm.handle).is_ok() {
            vm.state = VmState::Idle;
            self.idle.lock().await.push(vm);
        } else {
            let _ = self.hypervisor.destroy(&vm.handle);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_vm_runtime::mock::{MockGuestImage, MockHypervisor};

    fn pool(max_concurrency: usize) -> VmPool {
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let template = hv.create_template(Arc::new(MockGuestImage::new()), &[]).unwrap();
        VmPool::new(hv, template, max_concurrency)
    }

    #[tokio::test]
    async fn reserve_forks_up_to_max_concurrency_then_blocks() {
        let p = pool(2);
        let a = p.reserve(Duration::from_millis(50)).await.unwrap();
        let b = p.reserve(Duration::from_millis(50)).await.unwrap();
        assert_eq!(p.outstanding(), 2);
        let timeout = p.reserve(Duration::from_millis(20)).await;
        assert!(matches!(timeout, Err(EngineError::ReserveTimeout)));
        p.release(a, false).await;
        let c = p.reserve(Duration::from_millis(50)).await;
        assert!(c.is_ok());
        p.release(b, false).await;
        p.release(c.unwrap(), false).await;
    }

    #[tokio::test]
    async fn released_vm_is_reused_before_forking_a_new_one() {
        let p = pool(4);
        let a = p.reserve(Duration::from_millis(50)).await.unwrap();
        p.release(a, false).await;
        assert_eq!(p.idle_count().await, 1);
        let _b = p.reserve(Duration::from_millis(50)).await.unwrap();
        assert_eq!(p.idle_count().await, 0);
        assert_eq!(p.outstanding(), 1);
    }

    #[tokio::test]
    async fn draining_vm_is_destroyed_not_recycled() {
        let p = pool(2);
        let a = p.reserve(Duration::from_millis(50)).await.unwrap();
        p.release(a, true).await;
        assert_eq!(p.idle_count().await, 0);
        assert_eq!(p.outstanding(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_future_reservations() {
        let p = pool(2);
        p.shutdown();
        let res = p.reserve(Duration::from_millis(20)).await;
        assert!(matches!(res, Err(EngineError::PoolShutdown)));
    }
}
