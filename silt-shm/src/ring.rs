//! # Ring Buffers
//!
//! Fixed-capacity circular queues over shared memory, with per-cell sequence
//! numbers so producers publish monotonically and the consumer only ever
//! observes completed cells. Three variants, selected at the type level the
//! way the containing structures pick their queue flavor:
//!
//! - [`SpscRingBuffer`] — single producer, fixed size, `NoSpace` when full.
//! - [`MpscRingBuffer`] — CAS multi-push, single consumer, fixed size.
//! - [`ExtRingBuffer`]  — single producer, grows by reallocating its cells.
//!
//! Cell protocol: a cell at position `p` carries `seq == p` while empty,
//! `seq == p + 1` once its value is published, and `seq == p + capacity`
//! after the consumer takes it (making it empty for the next lap). A partial
//! write is never visible: the value is stored before the release store of
//! the sequence.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ShmError, ShmResult};
use crate::ptr::{Allocator, OffsetPtr};

/// One slot of a ring buffer.
#[repr(C)]
struct RingCell<T> {
    seq: AtomicU64,
    val: MaybeUninit<T>,
}

/// Shared-memory ring buffer header. The cell storage is a separate
/// allocation so the header can sit inside other shared structures.
#[repr(C)]
pub struct RingBuffer<T: Copy, const MPSC: bool, const EXT: bool> {
    /// Consumer index.
    head: AtomicU64,
    /// Producer index.
    tail: AtomicU64,
    capacity: u64,
    cells: OffsetPtr,
    _marker: PhantomData<T>,
}

/// Single-producer single-consumer, fixed capacity.
pub type SpscRingBuffer<T> = RingBuffer<T, false, false>;
/// Multi-producer single-consumer, fixed capacity.
pub type MpscRingBuffer<T> = RingBuffer<T, true, false>;
/// Single-producer single-consumer, grows when full.
pub type ExtRingBuffer<T> = RingBuffer<T, false, true>;

impl<T: Copy, const MPSC: bool, const EXT: bool> RingBuffer<T, MPSC, EXT> {
    /// Bytes of cell storage needed for `depth` entries.
    pub fn cell_bytes(depth: u64) -> usize {
        depth as usize * std::mem::size_of::<RingCell<T>>()
    }

    /// Write an empty header at `ptr`; pair with [`Self::init`].
    ///
    /// # Safety
    /// `ptr` must be valid, properly aligned storage for a header.
    pub unsafe fn construct_at(ptr: *mut Self) {
        std::ptr::write(
            ptr,
            Self {
                head: AtomicU64::new(0),
                tail: AtomicU64::new(0),
                capacity: 0,
                cells: OffsetPtr::NULL,
                _marker: PhantomData,
            },
        );
    }

    /// Initialize in place with `depth` cells allocated from `alloc`.
    pub fn init<A: Allocator>(&mut self, alloc: &A, depth: u64) -> ShmResult<()> {
        debug_assert!(depth > 0);
        let cells = alloc.allocate(Self::cell_bytes(depth));
        if cells.is_null() {
            return Err(ShmError::OutOfMemory);
        }
        self.head = AtomicU64::new(0);
        self.tail = AtomicU64::new(0);
        self.capacity = depth;
        self.cells = cells;
        let base = alloc.resolve_t::<RingCell<T>>(cells);
        for i in 0..depth {
            // SAFETY: cells covers depth entries; only seq needs initializing.
            unsafe { (*base.add(i as usize)).seq = AtomicU64::new(i) };
        }
        Ok(())
    }

    /// Release the cell storage back to `alloc`.
    pub fn destroy<A: Allocator>(&mut self, alloc: &A) {
        if !self.cells.is_null() {
            alloc.free(self.cells, Self::cell_bytes(self.capacity));
            self.cells = OffsetPtr::NULL;
            self.capacity = 0;
        }
    }

    fn cell<A: Allocator>(&self, alloc: &A, pos: u64) -> *mut RingCell<T> {
        let base = alloc.resolve_t::<RingCell<T>>(self.cells);
        // SAFETY: pos is reduced modulo capacity.
        unsafe { base.add((pos % self.capacity) as usize) }
    }

    /// The advertised capacity; exactly this many entries fit.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of entries currently queued (approximate under concurrency).
    pub fn len(&self) -> u64 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer is full.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Attempt to publish a value without growing.
    ///
    /// Fails with `NoSpace` when every cell is occupied.
    pub fn try_push<A: Allocator>(&self, alloc: &A, val: T) -> ShmResult<()> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = self.cell(alloc, tail);
            // SAFETY: cell points into live cell storage.
            let seq = unsafe { (*cell).seq.load(Ordering::Acquire) };
            if seq == tail {
                if MPSC {
                    match self.tail.compare_exchange_weak(
                        tail,
                        tail + 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: winning the CAS grants exclusive write
                            // access to this cell for this lap.
                            unsafe {
                                (*cell).val.as_mut_ptr().write(val);
                                (*cell).seq.store(tail + 1, Ordering::Release);
                            }
                            return Ok(());
                        }
                        Err(observed) => tail = observed,
                    }
                } else {
                    self.tail.store(tail + 1, Ordering::Relaxed);
                    // SAFETY: single producer; this cell is empty for this lap.
                    unsafe {
                        (*cell).val.as_mut_ptr().write(val);
                        (*cell).seq.store(tail + 1, Ordering::Release);
                    }
                    return Ok(());
                }
            } else if seq < tail {
                // The cell one lap behind has not been consumed: full.
                return Err(ShmError::NoSpace);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Take the oldest entry. Single consumer only.
    pub fn try_pop<A: Allocator>(&self, alloc: &A) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let cell = self.cell(alloc, head);
        // SAFETY: cell points into live cell storage.
        let seq = unsafe { (*cell).seq.load(Ordering::Acquire) };
        if seq != head + 1 {
            return None;
        }
        // SAFETY: seq == head + 1 means the producer's release store of this
        // value happened before our acquire load.
        let val = unsafe { (*cell).val.assume_init_read() };
        unsafe { (*cell).seq.store(head + self.capacity, Ordering::Release) };
        self.head.store(head + 1, Ordering::Relaxed);
        Some(val)
    }

    /// Alias for [`Self::try_pop`], named for symmetry with `push`.
    pub fn pop<A: Allocator>(&self, alloc: &A) -> Option<T> {
        self.try_pop(alloc)
    }

    /// Drop all queued entries and rewind the indices.
    ///
    /// Only valid while no producer is concurrently pushing.
    pub fn clear<A: Allocator>(&self, alloc: &A) {
        let base = alloc.resolve_t::<RingCell<T>>(self.cells);
        for i in 0..self.capacity {
            // SAFETY: exclusive access per the caller contract.
            unsafe { (*base.add(i as usize)).seq.store(i, Ordering::Relaxed) };
        }
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Release);
    }

    /// Alias for [`Self::clear`].
    pub fn reset<A: Allocator>(&self, alloc: &A) {
        self.clear(alloc);
    }
}

impl<T: Copy, const MPSC: bool> RingBuffer<T, MPSC, false> {
    /// Publish a value; `NoSpace` when the fixed buffer is full.
    pub fn push<A: Allocator>(&self, alloc: &A, val: T) -> ShmResult<()> {
        self.try_push(alloc, val)
    }
}

impl<T: Copy> RingBuffer<T, false, true> {
    /// Publish a value, doubling the cell storage when full.
    ///
    /// Fails only when the allocator itself is exhausted.
    pub fn push<A: Allocator>(&mut self, alloc: &A, val: T) -> ShmResult<()> {
        match self.try_push(alloc, val) {
            Err(ShmError::NoSpace) => {
                self.grow(alloc)?;
                self.try_push(alloc, val)
            }
            other => other,
        }
    }

    /// Double the capacity, compacting live entries to the front.
    fn grow<A: Allocator>(&mut self, alloc: &A) -> ShmResult<()> {
        let old_cap = self.capacity;
        let new_cap = old_cap * 2;
        let new_cells = alloc.allocate(Self::cell_bytes(new_cap));
        if new_cells.is_null() {
            return Err(ShmError::OutOfMemory);
        }

        let new_base = alloc.resolve_t::<RingCell<T>>(new_cells);
        let mut count: u64 = 0;
        while let Some(val) = self.try_pop(alloc) {
            // SAFETY: count < old_cap <= new_cap.
            unsafe {
                let cell = new_base.add(count as usize);
                (*cell).val.as_mut_ptr().write(val);
                (*cell).seq = AtomicU64::new(count + 1);
            }
            count += 1;
        }
        for i in count..new_cap {
            // SAFETY: i < new_cap.
            unsafe { (*new_base.add(i as usize)).seq = AtomicU64::new(i) };
        }

        alloc.free(self.cells, Self::cell_bytes(old_cap));
        self.cells = new_cells;
        self.capacity = new_cap;
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(count, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaAllocator;
    use crate::backend::{MallocBackend, MemoryBackendId};
    use crate::ptr::AllocatorId;

    fn test_alloc(size: usize) -> (MallocBackend, ArenaAllocator) {
        let backend = MallocBackend::create(MemoryBackendId(0), size).unwrap();
        let arena = ArenaAllocator::create(AllocatorId::new(0, 0), backend.data_region());
        (backend, arena)
    }

    fn make_ring<T: Copy, const MPSC: bool, const EXT: bool>(
        alloc: &ArenaAllocator,
        depth: u64,
    ) -> Box<RingBuffer<T, MPSC, EXT>> {
        let mut rb: Box<RingBuffer<T, MPSC, EXT>> = Box::new(RingBuffer {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            capacity: 0,
            cells: OffsetPtr::NULL,
            _marker: PhantomData,
        });
        rb.init(alloc, depth).unwrap();
        rb
    }

    #[test]
    fn test_spsc_fifo() {
        let (_backend, alloc) = test_alloc(1 << 20);
        let rb = make_ring::<u64, false, false>(&alloc, 16);

        assert_eq!(rb.capacity(), 16);
        assert!(rb.is_empty());
        for i in 1..=5u64 {
            rb.push(&alloc, i * 10).unwrap();
        }
        assert_eq!(rb.len(), 5);
        for i in 1..=5u64 {
            assert_eq!(rb.pop(&alloc), Some(i * 10));
        }
        assert!(rb.is_empty());
        assert_eq!(rb.pop(&alloc), None);
    }

    #[test]
    fn test_overflow_then_recover() {
        let (_backend, alloc) = test_alloc(1 << 20);
        let rb = make_ring::<u32, false, false>(&alloc, 4);

        for i in 1..=4u32 {
            rb.push(&alloc, i).unwrap();
        }
        assert!(rb.is_full());
        // Fifth push reports no space.
        assert_eq!(rb.push(&alloc, 5).err(), Some(ShmError::NoSpace));

        // After one pop, a push succeeds and FIFO order is preserved.
        assert_eq!(rb.pop(&alloc), Some(1));
        rb.push(&alloc, 5).unwrap();
        let drained: Vec<u32> = std::iter::from_fn(|| rb.pop(&alloc)).collect();
        assert_eq!(drained, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_wrap_around_many_laps() {
        let (_backend, alloc) = test_alloc(1 << 20);
        let rb = make_ring::<u64, false, false>(&alloc, 8);

        for lap in 0..5u64 {
            for i in 0..6u64 {
                rb.push(&alloc, lap * 100 + i).unwrap();
            }
            for i in 0..6u64 {
                assert_eq!(rb.pop(&alloc), Some(lap * 100 + i));
            }
        }
        assert!(rb.is_empty());
    }

    #[test]
    fn test_clear_and_reuse() {
        let (_backend, alloc) = test_alloc(1 << 20);
        let rb = make_ring::<u32, false, false>(&alloc, 8);
        for i in 0..5u32 {
            rb.push(&alloc, i).unwrap();
        }
        rb.clear(&alloc);
        assert!(rb.is_empty());
        rb.push(&alloc, 99).unwrap();
        assert_eq!(rb.pop(&alloc), Some(99));
    }

    #[test]
    fn test_mpsc_concurrent_producers() {
        use std::sync::Arc;

        let (backend, alloc) = test_alloc(1 << 20);
        let rb = Arc::new(make_ring::<u64, true, false>(&alloc, 1024));
        let _keep = backend;

        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 200;

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let rb = rb.clone();
            let alloc = alloc;
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let val = p * 1_000_000 + i;
                    loop {
                        match rb.try_push(&alloc, val) {
                            Ok(()) => break,
                            Err(ShmError::NoSpace) => std::thread::yield_now(),
                            Err(e) => panic!("unexpected push error: {}", e),
                        }
                    }
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            if let Some(v) = rb.try_pop(&alloc) {
                seen.push(v);
            } else {
                std::thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        // No loss, no duplication, and per-producer order is preserved.
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
    }

    #[test]
    fn test_ext_ring_grows() {
        let (_backend, alloc) = test_alloc(1 << 20);
        let mut rb = make_ring::<u64, false, true>(&alloc, 4);

        for i in 0..64u64 {
            rb.push(&alloc, i).unwrap();
        }
        assert!(rb.capacity() >= 64);
        for i in 0..64u64 {
            assert_eq!(rb.pop(&alloc), Some(i));
        }
        assert!(rb.is_empty());
        assert_eq!(rb.len(), 0);
    }

    #[test]
    fn test_ext_ring_interleaved_balance() {
        let (_backend, alloc) = test_alloc(1 << 20);
        let mut rb = make_ring::<u64, false, true>(&alloc, 2);

        let mut pushed = Vec::new();
        let mut popped = Vec::new();
        let mut next = 0u64;
        // Interleave pushes and pops in bursts; totals balance at the end.
        for round in 0..10 {
            for _ in 0..(round + 3) {
                rb.push(&alloc, next).unwrap();
                pushed.push(next);
                next += 1;
            }
            for _ in 0..(round + 1) {
                if let Some(v) = rb.pop(&alloc) {
                    popped.push(v);
                }
            }
        }
        while let Some(v) = rb.pop(&alloc) {
            popped.push(v);
        }
        assert_eq!(rb.len(), 0);
        assert!(rb.is_empty());
        assert_eq!(popped, pushed);
    }
}
