//! # Multi-Lane Ring Buffer
//!
//! A matrix of `lanes × prios` independent ring buffers in contiguous
//! shared storage, addressed as `(lane, priority)` with O(1) indexing.
//! Shape and depth are fixed at construction.

use std::marker::PhantomData;

use crate::error::{ShmError, ShmResult};
use crate::ptr::{Allocator, OffsetPtr};
use crate::ring::RingBuffer;

/// Shared-memory header for the ring matrix.
#[repr(C)]
pub struct MultiRingBuffer<T: Copy, const MPSC: bool> {
    num_lanes: u64,
    num_prios: u64,
    /// Contiguous array of `num_lanes * num_prios` ring headers.
    rings: OffsetPtr,
    _marker: PhantomData<T>,
}

/// The usual shape for task queues: MPSC fixed rings.
pub type MultiMpscRingBuffer<T> = MultiRingBuffer<T, true>;

impl<T: Copy, const MPSC: bool> MultiRingBuffer<T, MPSC> {
    /// Initialize in place: `lanes * prios` rings of `depth` entries each,
    /// headers and cell storage allocated from `alloc`.
    pub fn init<A: Allocator>(
        &mut self,
        alloc: &A,
        lanes: u64,
        prios: u64,
        depth: u64,
    ) -> ShmResult<()> {
        debug_assert!(lanes > 0 && prios > 0);
        let count = lanes * prios;
        let rings = alloc.allocate(count as usize * std::mem::size_of::<RingBuffer<T, MPSC, false>>());
        if rings.is_null() {
            return Err(ShmError::OutOfMemory);
        }
        self.num_lanes = lanes;
        self.num_prios = prios;
        self.rings = rings;

        let base = alloc.resolve_t::<RingBuffer<T, MPSC, false>>(rings);
        for i in 0..count {
            // SAFETY: the array covers `count` ring headers; each is
            // initialized in place before use.
            unsafe {
                let ring = base.add(i as usize);
                RingBuffer::construct_at(ring);
                (*ring).init(alloc, depth)?;
            }
        }
        Ok(())
    }

    /// Write an empty header at `ptr`; pair with [`Self::init`].
    ///
    /// # Safety
    /// `ptr` must be valid, properly aligned storage for a header.
    pub unsafe fn construct_at(ptr: *mut Self) {
        std::ptr::write(
            ptr,
            Self {
                num_lanes: 0,
                num_prios: 0,
                rings: OffsetPtr::NULL,
                _marker: PhantomData,
            },
        );
    }

    /// The ring at `(lane, prio)`.
    pub fn lane<A: Allocator>(&self, alloc: &A, lane: u64, prio: u64) -> &RingBuffer<T, MPSC, false> {
        assert!(lane < self.num_lanes);
        assert!(prio < self.num_prios);
        let idx = lane * self.num_prios + prio;
        let base = alloc.resolve_t::<RingBuffer<T, MPSC, false>>(self.rings);
        // SAFETY: idx < num_lanes * num_prios; the array was initialized.
        unsafe { &*base.add(idx as usize) }
    }

    /// Number of lanes.
    pub fn num_lanes(&self) -> u64 {
        self.num_lanes
    }

    /// Priority levels per lane.
    pub fn num_prios(&self) -> u64 {
        self.num_prios
    }

    /// Total number of rings.
    pub fn total_rings(&self) -> u64 {
        self.num_lanes * self.num_prios
    }
}
