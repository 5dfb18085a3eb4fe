//! # Task Queue
//!
//! The shared multi-lane MPSC ring buffer tasks travel through, shaped
//! `(lanes × priorities)` at runtime startup. Each lane carries a header
//! recording its assigned worker, pending count, enqueued flag, wake-up
//! descriptor and active state.
//!
//! Enqueue is MPSC per lane; dequeue belongs to the lane's assigned worker
//! only. Within a `(lane, priority)` delivery is FIFO; a higher priority
//! preempts only at dequeue time; across lanes nothing is promised.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use silt_shm::multi_ring::MultiMpscRingBuffer;
use silt_shm::{Allocator, MemResolver, MpAllocator, OffsetPtr, ShmError, ShmPtr, ShmResult};

use crate::error::{RuntimeError, RuntimeResult};
use crate::signal::EventFd;
use crate::types::{LaneId, TaskId, WorkerId};

/// One queued task reference.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QueueEntry {
    /// The task record in shared memory.
    pub task: ShmPtr,
    /// The task's identity, for diagnostics without a dereference.
    pub task_id: TaskId,
}

/// Per-lane shared state.
#[repr(C)]
pub struct LaneHeader {
    assigned_worker: AtomicU32,
    /// Tasks currently queued across this lane's priorities.
    pending: AtomicU32,
    /// 0→1 transition triggers a wake-up write.
    is_enqueued: AtomicU32,
    /// Whether the owning worker is accepting (1) or parked in epoll (0).
    active: AtomicU32,
    wake_fd: AtomicI32,
    _pad: u32,
}

impl LaneHeader {
    /// The worker assigned to this lane.
    pub fn assigned_worker(&self) -> WorkerId {
        WorkerId(self.assigned_worker.load(Ordering::Acquire))
    }

    /// Tasks currently pending on the lane.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// The wake-up descriptor recorded by the owning worker.
    pub fn wake_fd(&self) -> i32 {
        self.wake_fd.load(Ordering::Acquire)
    }

    /// Mark the owning worker as accepting or parked.
    pub fn set_active(&self, active: bool) {
        self.active.store(active as u32, Ordering::Release);
    }

    /// Whether the owning worker is accepting.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }
}

/// Shared queue header: lane headers, then the ring matrix.
#[repr(C)]
struct TaskQueueHeader {
    num_lanes: u64,
    num_prios: u64,
    depth: u64,
    lanes: OffsetPtr,
    rings: MultiMpscRingBuffer<QueueEntry>,
}

/// Process-local handle to the shared task queue.
#[derive(Clone, Copy)]
pub struct TaskQueue {
    alloc: MpAllocator,
    off: OffsetPtr,
    header: *mut TaskQueueHeader,
}

impl TaskQueue {
    /// Build a new queue in shared memory.
    pub fn create(alloc: &MpAllocator, lanes: u64, prios: u64, depth: u64) -> ShmResult<Self> {
        let off = alloc.allocate(std::mem::size_of::<TaskQueueHeader>());
        if off.is_null() {
            return Err(ShmError::OutOfMemory);
        }
        let header = alloc.resolve_t::<TaskQueueHeader>(off);

        let lanes_off = alloc.allocate(lanes as usize * std::mem::size_of::<LaneHeader>());
        if lanes_off.is_null() {
            return Err(ShmError::OutOfMemory);
        }
        // SAFETY: both allocations are live; initialize every field in place.
        unsafe {
            (*header).num_lanes = lanes;
            (*header).num_prios = prios;
            (*header).depth = depth;
            (*header).lanes = lanes_off;
            MultiMpscRingBuffer::construct_at(&mut (*header).rings);
            (*header).rings.init(alloc, lanes, prios, depth)?;

            let lane_base = alloc.resolve_t::<LaneHeader>(lanes_off);
            for i in 0..lanes {
                let lane = lane_base.add(i as usize);
                (*lane).assigned_worker = AtomicU32::new(0);
                (*lane).pending = AtomicU32::new(0);
                (*lane).is_enqueued = AtomicU32::new(0);
                (*lane).active = AtomicU32::new(1);
                (*lane).wake_fd = AtomicI32::new(-1);
                (*lane)._pad = 0;
            }
        }
        Ok(Self {
            alloc: *alloc,
            off,
            header,
        })
    }

    /// Attach to a queue created by another process over the same region.
    pub fn attach(alloc: &MpAllocator, off: OffsetPtr) -> Self {
        Self {
            alloc: *alloc,
            off,
            header: alloc.resolve_t::<TaskQueueHeader>(off),
        }
    }

    /// The queue header's offset (published through the superblock).
    pub fn offset(&self) -> OffsetPtr {
        self.off
    }

    fn header(&self) -> &TaskQueueHeader {
        // SAFETY: create/attach pointed this at a live header.
        unsafe { &*self.header }
    }

    /// Number of lanes.
    pub fn num_lanes(&self) -> u64 {
        self.header().num_lanes
    }

    /// Priority levels per lane.
    pub fn num_prios(&self) -> u64 {
        self.header().num_prios
    }

    /// The shared header of `lane`.
    pub fn lane_header(&self, lane: LaneId) -> &LaneHeader {
        assert!((lane.0 as u64) < self.num_lanes());
        let base = self.alloc.resolve_t::<LaneHeader>(self.header().lanes);
        // SAFETY: lane index checked above; the array was initialized.
        unsafe { &*base.add(lane.0 as usize) }
    }

    /// Bind `lane` to a worker and its wake-up descriptor. Used at startup
    /// and by [`Self::reassign`].
    pub fn bind_lane(&self, lane: LaneId, worker: WorkerId, wake_fd: i32) {
        let header = self.lane_header(lane);
        header.assigned_worker.store(worker.0, Ordering::Release);
        header.wake_fd.store(wake_fd, Ordering::Release);
    }

    /// Reassign a drained lane to another worker.
    ///
    /// Only permitted while the lane is empty; reassigning a non-empty lane
    /// would hand its queued tasks to a second consumer.
    pub fn reassign(&self, lane: LaneId, worker: WorkerId, wake_fd: i32) {
        debug_assert_eq!(
            self.lane_header(lane).pending(),
            0,
            "lane must be drained before reassignment"
        );
        self.bind_lane(lane, worker, wake_fd);
    }

    /// Push a task onto `(lane, prio)` and wake the assigned worker when the
    /// lane transitions from empty to non-empty.
    pub fn enqueue(&self, lane: LaneId, prio: u32, entry: QueueEntry) -> RuntimeResult<()> {
        assert!((prio as u64) < self.num_prios());
        let ring = self
            .header()
            .rings
            .lane(&self.alloc, lane.0 as u64, prio as u64);
        ring.push(&self.alloc, entry).map_err(|e| match e {
            ShmError::NoSpace => RuntimeError::QueueFull,
            other => RuntimeError::Shm(other),
        })?;

        let header = self.lane_header(lane);
        header.pending.fetch_add(1, Ordering::AcqRel);
        if header.is_enqueued.swap(1, Ordering::AcqRel) == 0 {
            EventFd::signal_raw(header.wake_fd());
        }
        Ok(())
    }

    /// Pop the oldest task of `(lane, prio)`. Assigned-worker only.
    ///
    /// Clears the enqueued flag when the pop finds the ring empty, re-arming
    /// the wake-up edge for producers (and re-sets it if a push raced in).
    pub fn dequeue(&self, lane: LaneId, prio: u32) -> Option<QueueEntry> {
        assert!((prio as u64) < self.num_prios());
        let ring = self
            .header()
            .rings
            .lane(&self.alloc, lane.0 as u64, prio as u64);
        match ring.pop(&self.alloc) {
            Some(entry) => {
                self.lane_header(lane).pending.fetch_sub(1, Ordering::AcqRel);
                Some(entry)
            }
            None => {
                let header = self.lane_header(lane);
                header.is_enqueued.store(0, Ordering::Release);
                if !ring.is_empty() {
                    // A producer slipped in between the pop and the clear;
                    // keep the flag armed so no wake-up is lost.
                    header.is_enqueued.store(1, Ordering::Release);
                }
                None
            }
        }
    }

    /// Total tasks pending across all lanes.
    pub fn total_pending(&self) -> u64 {
        (0..self.num_lanes())
            .map(|l| self.lane_header(LaneId(l as u32)).pending() as u64)
            .sum()
    }
}

unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_shm::backend::{MallocBackend, MemoryBackendId};
    use silt_shm::AllocatorId;

    use crate::types::next_task_id;

    fn fixture(lanes: u64, prios: u64, depth: u64) -> (MallocBackend, MpAllocator, TaskQueue) {
        let backend = MallocBackend::create(MemoryBackendId(0), 32 << 20).unwrap();
        let alloc = MpAllocator::create(AllocatorId::new(0, 0), backend.data_region());
        let queue = TaskQueue::create(&alloc, lanes, prios, depth).unwrap();
        (backend, alloc, queue)
    }

    fn entry(off: u64) -> QueueEntry {
        QueueEntry {
            task: ShmPtr::new(AllocatorId::new(0, 0), OffsetPtr::new(off)),
            task_id: next_task_id(),
        }
    }

    #[test]
    fn test_fifo_within_lane_priority() {
        let (_b, _a, queue) = fixture(2, 2, 16);
        for i in 1..=5u64 {
            queue.enqueue(LaneId(0), 0, entry(i * 64)).unwrap();
        }
        for i in 1..=5u64 {
            let e = queue.dequeue(LaneId(0), 0).unwrap();
            assert_eq!(e.task.off.get(), i * 64);
        }
        assert!(queue.dequeue(LaneId(0), 0).is_none());
    }

    #[test]
    fn test_pending_counts() {
        let (_b, _a, queue) = fixture(2, 2, 16);
        queue.enqueue(LaneId(1), 0, entry(64)).unwrap();
        queue.enqueue(LaneId(1), 1, entry(128)).unwrap();
        assert_eq!(queue.lane_header(LaneId(1)).pending(), 2);
        assert_eq!(queue.lane_header(LaneId(0)).pending(), 0);
        assert_eq!(queue.total_pending(), 2);

        queue.dequeue(LaneId(1), 1).unwrap();
        assert_eq!(queue.lane_header(LaneId(1)).pending(), 1);
    }

    #[test]
    fn test_queue_full() {
        let (_b, _a, queue) = fixture(1, 1, 4);
        for i in 0..4u64 {
            queue.enqueue(LaneId(0), 0, entry((i + 1) * 64)).unwrap();
        }
        let err = queue.enqueue(LaneId(0), 0, entry(999 * 64)).err();
        assert_eq!(err, Some(RuntimeError::QueueFull));
    }

    #[test]
    fn test_wakeup_edge_on_first_enqueue() {
        let (_b, _a, queue) = fixture(1, 1, 16);
        let efd = EventFd::new().unwrap();
        queue.bind_lane(LaneId(0), WorkerId(3), efd.raw());
        assert_eq!(queue.lane_header(LaneId(0)).assigned_worker(), WorkerId(3));

        let epoll = crate::signal::Epoll::new().unwrap();
        epoll.add(efd.raw(), 1).unwrap();

        queue.enqueue(LaneId(0), 0, entry(64)).unwrap();
        assert_eq!(epoll.wait(100, 4), vec![1]);
        efd.drain();

        // Second enqueue while non-empty: no new edge.
        queue.enqueue(LaneId(0), 0, entry(128)).unwrap();
        assert!(epoll.wait(0, 4).is_empty());

        // Drain the lane; the empty pop re-arms the edge.
        while queue.dequeue(LaneId(0), 0).is_some() {}
        queue.enqueue(LaneId(0), 0, entry(192)).unwrap();
        assert_eq!(epoll.wait(100, 4), vec![1]);
    }

    #[test]
    fn test_reassign_drained_lane() {
        let (_b, _a, queue) = fixture(2, 1, 8);
        let efd = EventFd::new().unwrap();
        queue.bind_lane(LaneId(0), WorkerId(0), efd.raw());
        queue.enqueue(LaneId(0), 0, entry(64)).unwrap();
        queue.dequeue(LaneId(0), 0).unwrap();

        let efd2 = EventFd::new().unwrap();
        queue.reassign(LaneId(0), WorkerId(1), efd2.raw());
        assert_eq!(queue.lane_header(LaneId(0)).assigned_worker(), WorkerId(1));
        assert_eq!(queue.lane_header(LaneId(0)).wake_fd(), efd2.raw());
    }

    #[test]
    fn test_attach_sees_entries() {
        let (_b, alloc, queue) = fixture(1, 1, 8);
        queue.enqueue(LaneId(0), 0, entry(64)).unwrap();

        let attached = TaskQueue::attach(&alloc, queue.offset());
        assert_eq!(attached.num_lanes(), 1);
        let e = attached.dequeue(LaneId(0), 0).unwrap();
        assert_eq!(e.task.off.get(), 64);
    }
}
