//! Long-Lived Socket Mode (C9, `SPEC_FULL.md` §4.9).
//!
//! One dedicated OS thread per Program Instance runs a `mio::Poll`
//! event loop outside `tokio`'s own reactor — `mio` is the low-level
//! crate production proxies reach for under their own async runtimes,
//! so using it directly here for a small dedicated non-async loop is
//! idiomatic rather than hand-rolling raw `epoll_wait` FFI. The thread
//! itself is the only place that ever touches the registered fds, so
//! dispatch needs no additional lock (§9 "message passing, no shared
//! mutable state").
//!
//! A donated fd's readable/writable/hangup events are forwarded into
//! the long-lived guest's own entry table (`FD_READABLE_SLOT` and
//! friends) by running the already-forked long-lived VM through the
//! same `Hypervisor::run_entry` path every other guest call uses —
//! there is no separate "event callback" mechanism at the hypervisor
//! boundary, just another entry slot.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use kvm_core::HttpVersion;
use kvm_vm_runtime::abi::GuestRunContext;
use kvm_vm_runtime::hypervisor::{GuestRequest, Hypervisor, VmHandle};

use crate::error::EngineError;

/// Entry slot a long-lived guest registers its readable handler at.
pub const FD_READABLE_SLOT: u32 = 100;
/// Entry slot for the writable handler.
pub const FD_WRITABLE_SLOT: u32 = 101;
/// Entry slot for the hangup handler.
pub const FD_HANGUP_SLOT: u32 = 102;

const READ_BUFFER_LEN: usize = 4096;
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LongLivedManager {
    donate_tx: mpsc::Sender<RawFd>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl LongLivedManager {
    /// Spawns the manager thread for one Program Instance's long-lived
    /// VM. `vm` must already be forked from that tenant's template;
    /// every dispatched event runs through it via `run_ctx`, the same
    /// shared regex cache and host callbacks an ordinary request uses.
    pub fn spawn(
        hypervisor: Arc<dyn Hypervisor>,
        vm: VmHandle,
        run_ctx: GuestRunContext,
    ) -> Result<Self, EngineError> {
        let poll = Poll::new().map_err(|e| EngineError::DonationRefused { message: e.to_string() })?;

        // Pre-allocated guest-visible read buffer (§4.9): allocated
        // once at spawn time rather than per event, so a real
        // hypervisor's guest-memory mapping stays stable across the
        // long-lived VM's whole lifetime.
        let read_buffer_addr = hypervisor
            .write_input(&vm, &[0u8; READ_BUFFER_LEN])
            .map_err(|e| EngineError::DonationRefused { message: e.to_string() })?;

        let (donate_tx, donate_rx) = mpsc::channel::<RawFd>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::spawn(move || {
            Self::event_loop(poll, donate_rx, hypervisor, vm, run_ctx, read_buffer_addr, thread_shutdown);
        });

        Ok(LongLivedManager {
            donate_tx,
            shutdown,
            handle: Some(handle),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn event_loop(
        mut poll: Poll,
        donate_rx: mpsc::Receiver<RawFd>,
        hypervisor: Arc<dyn Hypervisor>,
        vm: VmHandle,
        run_ctx: GuestRunContext,
        read_buffer_addr: u64,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut events = Events::with_capacity(128);
        let mut tokens: HashMap<Token, RawFd> = HashMap::new();
        let mut next_token = 0usize;

        while !shutdown.load(Ordering::Acquire) {
            while let Ok(fd) = donate_rx.try_recv() {
                let token = Token(next_token);
                next_token += 1;
                let mut source = SourceFd(&fd);
                if poll
                    .registry()
                    .register(&mut source, token, Interest::READABLE | Interest::WRITABLE)
                    .is_ok()
                {
                    tokens.insert(token, fd);
                }
            }

            if poll.poll(&mut events, Some(Duration::from_millis(100))).is_err() {
                continue;
            }

            for event in events.iter() {
                let Some(&fd) = tokens.get(&event.token()) else {
                    continue;
                };
                if event.is_read_closed() || event.is_write_closed() {
                    Self::dispatch(&hypervisor, &vm, &run_ctx, FD_HANGUP_SLOT, fd, read_buffer_addr, &[]);
                    tokens.remove(&event.token());
                    continue;
                }
                if event.is_readable() {
                    let mut buf = [0u8; READ_BUFFER_LEN];
                    let n = read_fd(fd, &mut buf).unwrap_or(0);
                    Self::dispatch(&hypervisor, &vm, &run_ctx, FD_READABLE_SLOT, fd, read_buffer_addr, &buf[..n]);
                }
                if event.is_writable() {
                    Self::dispatch(&hypervisor, &vm, &run_ctx, FD_WRITABLE_SLOT, fd, read_buffer_addr, &[]);
                }
            }
        }
    }

    /// Runs the long-lived guest's registered entry for one fd event.
    /// `arg` carries `{fd}:{read_buffer_addr}` so the guest can find
    /// both which connection fired and where its bytes were copied to,
    /// without needing a wider `GuestRequest` shape than the ordinary
    /// invocation path already has.
    fn dispatch(
        hypervisor: &Arc<dyn Hypervisor>,
        vm: &VmHandle,
        run_ctx: &GuestRunContext,
        slot: u32,
        fd: RawFd,
        read_buffer_addr: u64,
        bytes: &[u8],
    ) {
        let request = GuestRequest {
            url: "longlived".to_string(),
            arg: format!("{fd}:{read_buffer_addr}"),
            post: if bytes.is_empty() {
                None
            } else {
                Some(("application/octet-stream".to_string(), bytes.to_vec()))
            },
        };
        let deadline = Instant::now() + DISPATCH_TIMEOUT;
        if let Err(err) = hypervisor.run_entry(vm, slot, request, run_ctx.clone(), deadline) {
            tracing::warn!(fd, slot, error = %err, "long-lived dispatch failed");
        }
    }

    /// Donates `fd` to the manager thread (`begin_epoll`, §4.9).
    /// Refuses HTTP/2 connections before the manager is even touched,
    /// per the caller-enforced HTTP/1.x-only precondition.
    pub fn begin_epoll(&self, http_version: HttpVersion, fd: &mut RawFd) -> Result<(), EngineError> {
        if !http_version.supports_fd_donation() {
            return Err(EngineError::DonationRefused {
                message: "long-lived socket mode requires http/1.x".to_string(),
            });
        }
        let donated = *fd;
        *fd = -1;
        self.donate_tx.send(donated).map_err(|_| EngineError::DonationRefused {
            message: "long-lived manager thread is gone".to_string(),
        })
    }
}

impl Drop for LongLivedManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Reads whatever is available on `fd` without taking ownership of it
/// — `File::from_raw_fd`/`into_raw_fd` bookend the read so the fd is
/// never closed out from under the manager's own registration.
fn read_fd(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let result = file.read(buf);
    let _ = file.into_raw_fd();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_vm_runtime::abi::HostCallbacks;
    use kvm_vm_runtime::mock::{standalone_run_context, MockGuestImage, MockHypervisor};

    struct NoopHost;
    impl HostCallbacks for NoopHost {
        fn storage_callb(&self, _func: &str, _src: &[u8], _dst_cap: usize) -> Result<Vec<u8>, ()> {
            Ok(Vec::new())
        }
        fn storage_callv(&self, _func: &str, _iov: &[Vec<u8>], _dst_cap: usize) -> Result<Vec<u8>, ()> {
            Ok(Vec::new())
        }
        fn storage_task(&self, _func: &str, _arg: Vec<u8>) {}
        fn vmcommit(&self) -> Result<(), ()> {
            Ok(())
        }
    }

    fn manager_over_empty_vm() -> LongLivedManager {
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let template = hv.create_template(Arc::new(MockGuestImage::new()), &[]).unwrap();
        let vm = hv.fork(&template).unwrap();
        LongLivedManager::spawn(hv, vm, standalone_run_context(Arc::new(NoopHost))).unwrap()
    }

    #[test]
    fn begin_epoll_refuses_http2() {
        let manager = manager_over_empty_vm();
        let mut fd: RawFd = 7;
        let result = manager.begin_epoll(HttpVersion::Http2, &mut fd);
        assert!(matches!(result, Err(EngineError::DonationRefused { .. })));
        assert_eq!(fd, 7, "fd must not be taken when donation is refused");
    }

    #[test]
    fn begin_epoll_takes_ownership_of_the_fd_on_http11() {
        let manager = manager_over_empty_vm();
        let mut fd: RawFd = 999_999;
        manager.begin_epoll(HttpVersion::Http11, &mut fd).unwrap();
        assert_eq!(fd, -1);
    }
}
