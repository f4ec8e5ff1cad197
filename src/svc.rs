//! thin typed wrappers over the host syscall surface.
//!
//! everything the exploit asks of the kernel goes through the [`Platform`]
//! trait, so the orchestration is identical whether it drives real hardware
//! or the test simulator. status codes stay raw signed words the way the
//! kernel hands them out; callers check them after every call.

use bitflags::bitflags;

/// kernel handle. 32-bit, never a pointer.
pub type Handle = u32;

/// raw signed status as returned by the syscall layer. zero is success.
pub type RawStatus = i32;

#[inline]
pub fn failed(code: RawStatus) -> bool {
    code != 0
}

/// operation selector for [`Platform::control_memory`].
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemOp {
    Free = 1,
    Alloc = 3,
}

bitflags! {
    /// page permissions for [`Platform::control_memory`].
    pub struct MemPerm: u32 {
        const READ = 1;
        const WRITE = 2;
        /// used on free, where permissions are meaningless.
        const DONT_CARE = 0x1000_0000;
    }
}

/// address-arbitration modes. only the timeout form is used here, and not
/// for arbitration: with a zero timeout it lapses immediately, and the only
/// bit of the answer that matters is whether the kernel faulted reading the
/// watched word.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArbitrationMode {
    WaitIfLessThan = 1,
    WaitIfLessThanTimeout = 3,
}

/// status the arbiter returns while the watched address is not mapped into
/// userland.
pub const ARBITER_NO_ACCESS: RawStatus = 0xD900_1814_u32 as i32;

/// entry routine for a detached worker thread.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// the host platform contract. one implementation per world: the hardware
/// build issues the real syscalls, the simulator models the vulnerable
/// allocator with the same observable behavior.
pub trait Platform: Send + Sync {
    /// first address past the process heap. the raced mapping targets it.
    fn heap_end(&self) -> u32;

    /// hardware revision query. the newer revision moves the
    /// privilege-identifier field inside the process object.
    fn newer_hardware(&self) -> (RawStatus, bool);

    /// memory allocate/free request. returns (actual address, status).
    fn control_memory(&self, addr: u32, size: u32, op: MemOp, perm: MemPerm) -> (u32, RawStatus);

    /// spawn a detached thread on the given core.
    fn create_thread(&self, entry: ThreadEntry, stack_size: u32, priority: u8, core: i8)
        -> RawStatus;

    /// address arbitration against the process arbiter.
    fn arbitrate_address(
        &self,
        addr: u32,
        mode: ArbitrationMode,
        value: i32,
        timeout_ns: i64,
    ) -> RawStatus;

    /// create an event object. the creation syscall leaks the object's
    /// kernel virtual address in its second output register; the wrapper
    /// captures it. returns (status, handle, kernel address).
    fn create_event_kaddr(&self) -> (RawStatus, Handle, u32);

    /// close a handle. dropping the last reference to an object makes the
    /// kernel call through its dispatch table, which is exactly the point.
    fn close_handle(&self, handle: Handle) -> RawStatus;

    fn sleep(&self, ns: i64);

    /// allocate from the physically-contiguous linear region. the kernel can
    /// reach these buffers through physical addressing; plain heap memory it
    /// cannot. returns (address, status).
    fn linear_alloc(&self, size: u32) -> (u32, RawStatus);

    fn linear_free(&self, addr: u32, size: u32) -> RawStatus;

    /// code address of [`crate::payload::kernel_entry`] as the kernel will
    /// reach it when it calls through the planted table.
    fn payload_addr(&self) -> u32;

    /// CPU time-quota policy for the application cores. 30 forces every
    /// thread of this process onto one core, 80 is the normal policy.
    fn set_cpu_quota(&self, percent: u32) -> RawStatus;

    /// tear down the service-broker session.
    fn srv_exit(&self);

    /// re-establish the service-broker session. done after the kernel patch
    /// so the session comes back without the access-control restriction.
    fn srv_init(&self) -> RawStatus;

    /// raw userland memory access. on hardware these are pointer derefs;
    /// the simulator checks page accessibility and faults loudly.
    fn read_u32(&self, addr: u32) -> u32;
    fn write_u32(&self, addr: u32, value: u32);
    fn read_bytes(&self, addr: u32, buf: &mut [u8]);
    fn write_bytes(&self, addr: u32, data: &[u8]);
}

/// memory as seen with kernel privilege. only the patch payload and the
/// privilege patch/restore run against this.
pub trait KernelMem {
    fn read_u32(&self, addr: u32) -> u32;
    fn write_u32(&mut self, addr: u32, value: u32);
    /// instruction/data cache invalidation, needed after editing kernel code.
    fn invalidate_caches(&mut self);
}
