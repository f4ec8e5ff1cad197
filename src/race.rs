//! the two racing workers and the record they share.
//!
//! one writer, two readers, no lock: the allocate worker is the only thing
//! that moves `result` to a terminal value, and every participant shares the
//! one core the quota policy pinned them to.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::svc::{MemOp, MemPerm, Platform};

/// result value meaning no worker has finished yet.
pub const PENDING: i32 = -1;

/// terminal value the orchestrator installs when it abandons a run before
/// the allocate worker ever started, so the delay worker still terminates.
pub const ABORTED: i32 = i32::MIN;

/// how long the delay worker sleeps between polls. coarse enough to stay
/// cheap, short enough to keep the thread runnable through the window.
const DELAY_POLL_NS: i64 = 10_000;

/// shared state between the racing workers and the orchestrator.
pub struct AllocateRequest {
    addr: AtomicU32,
    size: u32,
    result: AtomicI32,
}

impl AllocateRequest {
    pub fn new(addr: u32, size: u32) -> Arc<AllocateRequest> {
        Arc::new(AllocateRequest {
            addr: AtomicU32::new(addr),
            size,
            result: AtomicI32::new(PENDING),
        })
    }

    /// target address, replaced by the actual address once the mapping
    /// request settles.
    pub fn addr(&self) -> u32 {
        self.addr.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// `None` while no worker has published a terminal result.
    pub fn result(&self) -> Option<i32> {
        match self.result.load(Ordering::Acquire) {
            PENDING => None,
            code => Some(code),
        }
    }

    /// publish the terminal result. called exactly once, by the allocate
    /// worker.
    pub fn publish(&self, code: i32) {
        self.result.store(code, Ordering::Release);
    }

    /// pending -> aborted, if still pending. loses against a concurrent
    /// [`publish`](Self::publish) and that is fine.
    pub fn abort(&self) {
        let _ = self
            .result
            .compare_exchange(PENDING, ABORTED, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// issues the slow multi-page mapping and publishes its result code. the
/// syscall itself is the race window: the kernel maps the first page long
/// before it commits the second.
pub fn allocate_worker(plat: Arc<dyn Platform>, req: Arc<AllocateRequest>) {
    let target = req.addr();
    let (actual, code) =
        plat.control_memory(target, req.size(), MemOp::Alloc, MemPerm::READ | MemPerm::WRITE);
    req.addr.store(actual, Ordering::Release);
    req.publish(code);
    debug!("allocate worker settled at {:#x}, status {:#x}", actual, code as u32);
}

/// keeps a second runnable thread on the core until the mapping settles.
/// it corrupts nothing; it only preserves the scheduling pattern the race
/// window depends on.
pub fn delay_worker(plat: Arc<dyn Platform>, req: Arc<AllocateRequest>) {
    while req.result().is_none() {
        plat.sleep(DELAY_POLL_NS);
    }
}
