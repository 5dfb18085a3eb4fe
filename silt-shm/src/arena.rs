//! # Arena Allocator
//!
//! A heap with `free` discarded: allocations are handed out by bumping a
//! cursor and only reclaimed all at once by [`ArenaAllocator::reset`].
//! Intended for initialization-time allocations with one coarse teardown.

use crate::heap::Heap;
use crate::ptr::{Allocator, AllocatorId, MemRegion, MemResolver, OffsetPtr};

/// Shared-memory header for an arena.
#[repr(C)]
pub struct ArenaHeader {
    heap: Heap,
}

/// Process-local handle to an arena living inside a region.
///
/// The header is placed at the start of the region; offsets are relative to
/// the region's base, so allocations resolve identically in every attached
/// process.
#[derive(Clone, Copy)]
pub struct ArenaAllocator {
    id: AllocatorId,
    region: MemRegion,
    header: *mut ArenaHeader,
}

impl ArenaAllocator {
    /// Initialize a new arena over `region` and return a handle to it.
    ///
    /// The header occupies the front of the region; the heap starts after it,
    /// so offset 0 (the null sentinel) is never handed out.
    pub fn create(id: AllocatorId, region: MemRegion) -> Self {
        // SAFETY: the region is a live mapping large enough for the header.
        let header = unsafe { region.base().add(region.start as usize) } as *mut ArenaHeader;
        let origin = region.start + std::mem::size_of::<ArenaHeader>() as u64;
        let origin = crate::heap::align_up(origin.max(1), 64);
        unsafe {
            (*header).heap.init(origin, region.end);
        }
        Self { id, region, header }
    }

    /// Attach to an arena previously created over `region`.
    pub fn attach(id: AllocatorId, region: MemRegion) -> Self {
        // SAFETY: create placed the header at the front of the region.
        let header = unsafe { region.base().add(region.start as usize) } as *mut ArenaHeader;
        Self { id, region, header }
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: create/attach pointed this at a live header.
        unsafe { &*self.header }
    }

    /// Bytes still available.
    pub fn remaining(&self) -> u64 {
        self.header().heap.remaining()
    }

    /// Rewind to the post-header origin, discarding all allocations.
    pub fn reset(&self) {
        self.header().heap.reset();
    }
}

impl MemResolver for ArenaAllocator {
    fn base(&self) -> *mut u8 {
        self.region.base()
    }
}

impl Allocator for ArenaAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn allocate(&self, size: usize) -> OffsetPtr {
        self.header().heap.allocate(size as u64)
    }

    fn free(&self, _off: OffsetPtr, _size: usize) {
        // Arena memory is reclaimed only by reset.
    }
}

unsafe impl Send for ArenaAllocator {}
unsafe impl Sync for ArenaAllocator {}
