//! overlay over the allocator's in-band free-chunk metadata.
//!
//! the first page of the raced mapping hands userland a live free-list
//! header. this type is the only place in the crate that writes through it.

use crate::layout::PAGE_SIZE;
use crate::svc::Platform;

/// header layout: size word, forward link, backward link. 12 bytes.
pub const HDR_SIZE_OFF: u32 = 0x0;
pub const HDR_NEXT_OFF: u32 = 0x4;
pub const HDR_PREV_OFF: u32 = 0x8;
pub const HDR_LEN: u32 = 0xC;

/// a free-chunk header at a fixed userland-visible address.
#[derive(Clone, Copy)]
pub struct ChunkHdr {
    base: u32,
}

impl ChunkHdr {
    /// overlay the header at `base`. the whole header must sit inside the
    /// page `base` points into; anything past it is someone else's memory.
    pub fn overlay(base: u32) -> ChunkHdr {
        assert!(base % PAGE_SIZE <= PAGE_SIZE - HDR_LEN);
        ChunkHdr { base }
    }

    /// redirect the forward link. the allocator's completion path follows
    /// this to find "the next free chunk" with no validation; the size word
    /// and the backward link are never read on that path.
    pub fn set_next(&self, plat: &dyn Platform, link: u32) {
        plat.write_u32(self.base + HDR_NEXT_OFF, link);
    }

    pub fn next(&self, plat: &dyn Platform) -> u32 {
        plat.read_u32(self.base + HDR_NEXT_OFF)
    }
}
