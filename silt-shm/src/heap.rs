//! # Bump-Pointer Heap
//!
//! Monotonically advancing offset allocation. Not an allocator itself: a
//! substrate for allocators that layer their own bookkeeping (free lists,
//! arena resets) on top. There is no free.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ptr::OffsetPtr;

/// Default allocation alignment in bytes.
pub const HEAP_ALIGN: u64 = 8;

/// Round `value` up to the nearest multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Bump-pointer heap over `[current, limit)`.
///
/// Lives inside shared memory (`repr(C)`, atomics only) so that every
/// attached process advances the same cursor.
#[repr(C)]
#[derive(Debug)]
pub struct Heap {
    /// Current top of the heap (offset of the next allocation).
    current: AtomicU64,
    /// One past the last allocatable offset.
    limit: u64,
    /// Offset the heap started at; `reset` rewinds to this.
    origin: u64,
}

impl Heap {
    /// Initialize the heap in place over `[origin, limit)`.
    pub fn init(&mut self, origin: u64, limit: u64) {
        debug_assert!(origin <= limit);
        self.current = AtomicU64::new(origin);
        self.limit = limit;
        self.origin = origin;
    }

    /// Allocate `size` bytes aligned to [`HEAP_ALIGN`].
    ///
    /// Returns the pre-advance offset, or null when the heap is exhausted or
    /// `size == 0`.
    pub fn allocate(&self, size: u64) -> OffsetPtr {
        self.allocate_aligned(size, HEAP_ALIGN)
    }

    /// Allocate `size` bytes with the start aligned to `align` relative to
    /// offset 0. Returns null when exhausted or `size == 0`.
    pub fn allocate_aligned(&self, size: u64, align: u64) -> OffsetPtr {
        if size == 0 {
            return OffsetPtr::NULL;
        }
        let mut cur = self.current.load(Ordering::Relaxed);
        loop {
            let start = align_up(cur, align);
            let end = start + size;
            if end > self.limit {
                return OffsetPtr::NULL;
            }
            match self.current.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return OffsetPtr::new(start),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Current top offset.
    pub fn offset(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// The exclusive upper bound.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The offset the heap started at.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Bytes remaining before exhaustion.
    pub fn remaining(&self) -> u64 {
        let cur = self.current.load(Ordering::Acquire);
        self.limit.saturating_sub(cur)
    }

    /// Rewind the cursor to the origin, discarding every allocation.
    ///
    /// Only safe when the caller knows no allocation is still referenced;
    /// arena allocators expose this as their coarse reset.
    pub fn reset(&self) {
        self.current.store(self.origin, Ordering::Release);
    }
}
