//! # Hierarchical Multi-Process Allocator
//!
//! Three tiers arranged to keep the common allocation off every lock:
//!
//! 1. **Thread block** — a per-thread buddy allocator over a chunk of
//!    `thread_unit` bytes. The fast path touches only this block.
//! 2. **Process block** — one per process, owning the thread blocks and a
//!    buddy allocator over `process_unit` bytes, guarded by its own lock.
//! 3. **Global pool** — a buddy allocator over the whole data region plus
//!    the process-block list, guarded by the global lock.
//!
//! When a thread block runs dry it refills from its process block; when the
//! process block runs dry it adopts a chunk from the global pool; the last
//! resort allocates from the global pool directly. Frees route back to the
//! tier whose heap issued the offset.

use std::cell::RefCell;
use std::collections::HashMap;

use nix::libc;

use crate::buddy::{BuddyAllocator, BUDDY_MAX_BLOCK};
use crate::heap::align_up;
use crate::lock::SpinLock;
use crate::ptr::{
    Allocator, AllocatorId, FullPtr, MemRegion, MemResolver, OffsetPtr, ShmPtr,
};
use crate::pre::slist::{Slist, SlistNode};

/// Header magic ("SILTMPA1").
const MP_MAGIC: u64 = 0x53494c544d504131;

/// Default thread-block chunk for large backends.
pub const DEFAULT_THREAD_UNIT: u64 = 16 * 1024 * 1024;
/// Default process-block chunk for large backends.
pub const DEFAULT_PROCESS_UNIT: u64 = 1024 * 1024 * 1024;

/// Per-thread allocator block stored at the front of its chunk.
#[repr(C)]
pub struct ThreadBlock {
    next: OffsetPtr,
    tid: u32,
    _pad: u32,
    /// Chunk bounds, root-relative.
    start: u64,
    size: u64,
}

impl SlistNode for ThreadBlock {
    fn next(&self) -> OffsetPtr {
        self.next
    }
    fn set_next(&mut self, next: OffsetPtr) {
        self.next = next;
    }
}

/// Per-process allocator block stored at the front of its chunk.
#[repr(C)]
pub struct ProcessBlock {
    next: OffsetPtr,
    pid: u32,
    tid_count: u32,
    lock: SpinLock,
    _pad: u32,
    threads: Slist<ThreadBlock>,
    /// Chunk bounds, root-relative.
    start: u64,
    size: u64,
}

impl SlistNode for ProcessBlock {
    fn next(&self) -> OffsetPtr {
        self.next
    }
    fn set_next(&mut self, next: OffsetPtr) {
        self.next = next;
    }
}

/// Global shared header at the front of the data region.
#[repr(C)]
pub struct MpHeader {
    magic: u64,
    /// Guards the process list.
    lock: SpinLock,
    pid_count: u32,
    process_unit: u64,
    thread_unit: u64,
    procs: Slist<ProcessBlock>,
}

impl MpHeader {
    fn size() -> u64 {
        align_up(std::mem::size_of::<MpHeader>() as u64, 64)
    }
}

fn block_header_size<T>() -> u64 {
    align_up(std::mem::size_of::<T>() as u64, 64)
}

/// Unit sizes scaled down for small backends.
fn pick_units(data_len: u64) -> (u64, u64) {
    if data_len < 1024 * 1024 * 1024 {
        let process_unit = (data_len / 4).max(2 * 1024 * 1024);
        let thread_unit = (process_unit / 4).min(4 * 1024 * 1024).max(128 * 1024);
        (process_unit, thread_unit)
    } else {
        (DEFAULT_PROCESS_UNIT, DEFAULT_THREAD_UNIT)
    }
}

thread_local! {
    /// Per-thread (process block, thread block) offsets, keyed by allocator
    /// identity so independent allocators in one process do not collide.
    static TLS_BLOCKS: RefCell<HashMap<AllocatorId, (u64, u64)>> = RefCell::new(HashMap::new());
}

/// Process-local handle to the hierarchical allocator.
#[derive(Clone, Copy)]
pub struct MpAllocator {
    id: AllocatorId,
    region: MemRegion,
    header: *mut MpHeader,
    global: BuddyAllocator,
}

impl MpAllocator {
    /// Initialize a new allocator over `region` (the creating process).
    pub fn create(id: AllocatorId, region: MemRegion) -> Self {
        // SAFETY: the region is a live mapping large enough for the header.
        let header = unsafe { region.base().add(region.start as usize) } as *mut MpHeader;
        let (process_unit, thread_unit) = pick_units(region.len());
        let global_region =
            MemRegion::new(region.base(), region.start + MpHeader::size(), region.end);
        let global = BuddyAllocator::create(AllocatorId::new(id.backend, 1), global_region);
        unsafe {
            (*header).magic = MP_MAGIC;
            (*header).lock.init();
            (*header).pid_count = 0;
            (*header).process_unit = process_unit;
            (*header).thread_unit = thread_unit;
            (*header).procs.init();
        }
        Self {
            id,
            region,
            header,
            global,
        }
    }

    /// Attach to an allocator another process created over the same region.
    /// The caller's process block is created lazily on first allocation.
    pub fn attach(id: AllocatorId, region: MemRegion) -> Option<Self> {
        let header = unsafe { region.base().add(region.start as usize) } as *mut MpHeader;
        // SAFETY: the creating process wrote the header before sharing.
        if unsafe { (*header).magic } != MP_MAGIC {
            return None;
        }
        let global_region =
            MemRegion::new(region.base(), region.start + MpHeader::size(), region.end);
        let global = BuddyAllocator::attach(AllocatorId::new(id.backend, 1), global_region);
        Some(Self {
            id,
            region,
            header,
            global,
        })
    }

    fn header(&self) -> &MpHeader {
        // SAFETY: create/attach pointed this at a live header.
        unsafe { &*self.header }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut MpHeader {
        // SAFETY: list mutation happens only under the header lock.
        unsafe { &mut *self.header }
    }

    /// The number of processes that have registered a process block.
    pub fn process_count(&self) -> u32 {
        self.header().pid_count
    }

    /// The thread-block chunk size in use.
    pub fn thread_unit(&self) -> u64 {
        self.header().thread_unit
    }

    fn pb_at(&self, off: u64) -> *mut ProcessBlock {
        self.region.resolve_t::<ProcessBlock>(OffsetPtr::new(off))
    }

    fn tb_at(&self, off: u64) -> *mut ThreadBlock {
        self.region.resolve_t::<ThreadBlock>(OffsetPtr::new(off))
    }

    /// Buddy handle over a process block's chunk.
    fn pb_buddy(&self, pb: &ProcessBlock) -> BuddyAllocator {
        let region = MemRegion::new(
            self.region.base(),
            pb.start + block_header_size::<ProcessBlock>(),
            pb.start + pb.size,
        );
        BuddyAllocator::attach(AllocatorId::new(self.id.backend, 2), region)
    }

    /// Buddy handle over a thread block's chunk.
    fn tb_buddy(&self, tb: &ThreadBlock) -> BuddyAllocator {
        let region = MemRegion::new(
            self.region.base(),
            tb.start + block_header_size::<ThreadBlock>(),
            tb.start + tb.size,
        );
        BuddyAllocator::attach(AllocatorId::new(self.id.backend, 3), region)
    }

    /// Find or create this process's block. Takes the global lock.
    fn ensure_process_block(&self) -> Option<u64> {
        // SAFETY: getpid never fails.
        let pid = unsafe { libc::getpid() } as u32;
        let header = self.header_mut();
        let _guard = header.lock.lock();

        // An existing block for this pid wins.
        let mut it = self.header().procs.iter(&self.region);
        loop {
            let node = it.next_node();
            if node.is_null() {
                break;
            }
            // SAFETY: nodes in the list are live process blocks.
            let pb = unsafe { node.get() };
            if pb.pid == pid {
                return Some(pb.start);
            }
        }

        let process_unit = header.process_unit;
        let off = self.global.allocate(process_unit as usize);
        if off.is_null() {
            return None;
        }
        let pb_ptr = self.pb_at(off.get());
        // SAFETY: the chunk was just allocated; write the record in place.
        unsafe {
            (*pb_ptr).next = OffsetPtr::NULL;
            (*pb_ptr).pid = pid;
            (*pb_ptr).tid_count = 0;
            (*pb_ptr).lock.init();
            (*pb_ptr).threads.init();
            (*pb_ptr).start = off.get();
            (*pb_ptr).size = process_unit;
            BuddyAllocator::create(
                AllocatorId::new(self.id.backend, 2),
                MemRegion::new(
                    self.region.base(),
                    off.get() + block_header_size::<ProcessBlock>(),
                    off.get() + process_unit,
                ),
            );
        }
        let node = FullPtr::new(pb_ptr, ShmPtr::new(self.id, off));
        header.procs.emplace_front(&self.region, node);
        header.pid_count += 1;
        Some(off.get())
    }

    /// Allocate a fresh thread block out of `pb`, adopting a global chunk
    /// when the process block is dry. Takes the process-block lock.
    fn allocate_thread_block(&self, pb_off: u64) -> Option<u64> {
        let thread_unit = self.header().thread_unit;
        // SAFETY: pb_off designates a live process block.
        let pb = unsafe { &mut *self.pb_at(pb_off) };
        let _guard = pb.lock.lock();
        let buddy = self.pb_buddy(pb);

        let mut tb_off = buddy.allocate(thread_unit as usize);
        if tb_off.is_null() && thread_unit <= BUDDY_MAX_BLOCK {
            // Medium path exhausted: adopt a chunk from the global pool.
            // Pointless for units above the top class, which only the heap
            // can serve.
            let chunk = self.global.allocate(thread_unit as usize);
            if !chunk.is_null() {
                buddy.adopt_extent(chunk, thread_unit);
                tb_off = buddy.allocate(thread_unit as usize);
            }
        }
        if tb_off.is_null() {
            return None;
        }

        let tb_ptr = self.tb_at(tb_off.get());
        // SAFETY: the chunk was just allocated; write the record in place.
        unsafe {
            (*tb_ptr).next = OffsetPtr::NULL;
            (*tb_ptr).tid = pb.tid_count;
            (*tb_ptr)._pad = 0;
            (*tb_ptr).start = tb_off.get();
            (*tb_ptr).size = thread_unit;
            BuddyAllocator::create(
                AllocatorId::new(self.id.backend, 3),
                MemRegion::new(
                    self.region.base(),
                    tb_off.get() + block_header_size::<ThreadBlock>(),
                    tb_off.get() + thread_unit,
                ),
            );
        }
        pb.tid_count += 1;
        let node = FullPtr::new(tb_ptr, ShmPtr::new(self.id, tb_off));
        pb.threads.emplace_front(&self.region, node);
        Some(tb_off.get())
    }

    /// The fast-path entry: this thread's block, created on first use.
    ///
    /// A thread whose block could not be carved (the region is too crowded)
    /// caches that outcome so later allocations go straight to the global
    /// pool instead of re-taking the block locks on every call.
    fn ensure_thread_block(&self) -> Option<u64> {
        let cached = TLS_BLOCKS.with(|map| map.borrow().get(&self.id).copied());
        if let Some((_, tb_off)) = cached {
            return if tb_off != 0 { Some(tb_off) } else { None };
        }
        let pb_off = self.ensure_process_block()?;
        let tb_off = self.allocate_thread_block(pb_off).unwrap_or(0);
        TLS_BLOCKS.with(|map| {
            map.borrow_mut().insert(self.id, (pb_off, tb_off));
        });
        if tb_off != 0 {
            Some(tb_off)
        } else {
            None
        }
    }

    /// Return this process's block and its chunk to the global pool.
    ///
    /// Called at process teardown, after every allocation made by this
    /// process has been freed or abandoned. Chunks adopted during expansion
    /// stay in the region and are reclaimed with the backend itself.
    pub fn release_process_block(&self) {
        // SAFETY: getpid never fails.
        let pid = unsafe { libc::getpid() } as u32;
        let header = self.header_mut();
        let _guard = header.lock.lock();

        let mut it = self.header().procs.iter(&self.region);
        loop {
            let node = it.next_node();
            if node.is_null() {
                return;
            }
            // SAFETY: nodes in the list are live process blocks.
            if unsafe { node.get().pid } == pid {
                let pb = header.procs.pop_at(&self.region, &it);
                let (start, size) = unsafe { (pb.get().start, pb.get().size) };
                header.pid_count -= 1;
                self.global.free(OffsetPtr::new(start), size as usize);
                TLS_BLOCKS.with(|map| {
                    map.borrow_mut().remove(&self.id);
                });
                return;
            }
        }
    }

    /// Route a free to the tier whose heap issued `off`.
    fn free_routed(&self, off: OffsetPtr, size: usize) {
        // Fast path: this thread's own block.
        let cached = TLS_BLOCKS.with(|map| map.borrow().get(&self.id).copied());
        if let Some((_, tb_off)) = cached.filter(|(_, tb)| *tb != 0) {
            // SAFETY: the TLS offset designates a live thread block.
            let tb = unsafe { &*self.tb_at(tb_off) };
            let buddy = self.tb_buddy(tb);
            if buddy.owns(off) {
                buddy.free(off, size);
                return;
            }
        }

        // Walk the block hierarchy for the owning heap.
        {
            let header = self.header_mut();
            let _guard = header.lock.lock();
            let mut pit = self.header().procs.iter(&self.region);
            loop {
                let pnode = pit.next_node();
                if pnode.is_null() {
                    break;
                }
                // SAFETY: nodes in the list are live process blocks.
                let pb = unsafe { pnode.get() };
                let mut tit = pb.threads.iter(&self.region);
                loop {
                    let tnode = tit.next_node();
                    if tnode.is_null() {
                        break;
                    }
                    let tb = unsafe { tnode.get() };
                    let buddy = self.tb_buddy(tb);
                    if buddy.owns(off) {
                        buddy.free(off, size);
                        return;
                    }
                }
                let buddy = self.pb_buddy(pb);
                if buddy.owns(off) {
                    let _pb_guard = unsafe { &*self.pb_at(pb.start) }.lock.lock();
                    buddy.free(off, size);
                    return;
                }
            }
        }

        // Whatever is left belongs to the global pool.
        self.global.free(off, size);
    }
}

impl MemResolver for MpAllocator {
    fn base(&self) -> *mut u8 {
        self.region.base()
    }
}

impl Allocator for MpAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn allocate(&self, size: usize) -> OffsetPtr {
        if size == 0 {
            return OffsetPtr::NULL;
        }
        // Tier 1: thread block, no shared state touched.
        if let Some(tb_off) = self.ensure_thread_block() {
            // SAFETY: the TLS offset designates a live thread block.
            let tb = unsafe { &*self.tb_at(tb_off) };
            let buddy = self.tb_buddy(tb);
            let off = buddy.allocate(size);
            if !off.is_null() {
                return off;
            }

            // Tier 2: refill the thread block from the process block and
            // retry the fast path. Requests above the buddy's top class can
            // never be served from a refilled block; they go straight to the
            // global pool.
            let cached = TLS_BLOCKS.with(|map| map.borrow().get(&self.id).copied());
            if size as u64 <= BUDDY_MAX_BLOCK {
                if let Some((pb_off, _)) = cached.filter(|(_, tb)| *tb != 0) {
                    let refill = self
                        .header()
                        .thread_unit
                        .max((size as u64).next_power_of_two());
                    // SAFETY: pb_off designates a live process block.
                    let pb = unsafe { &mut *self.pb_at(pb_off) };
                    let chunk = {
                        let _guard = pb.lock.lock();
                        let pb_buddy = self.pb_buddy(pb);
                        let mut chunk = pb_buddy.allocate(refill as usize);
                        if chunk.is_null() {
                            let global_chunk = self.global.allocate(refill as usize);
                            if !global_chunk.is_null() {
                                pb_buddy.adopt_extent(global_chunk, refill);
                                chunk = pb_buddy.allocate(refill as usize);
                            }
                        }
                        chunk
                    };
                    if !chunk.is_null() {
                        buddy.adopt_extent(chunk, refill);
                        let off = buddy.allocate(size);
                        if !off.is_null() {
                            return off;
                        }
                    }
                }
            }
        }

        // Tier 3: the global pool directly.
        self.global.allocate(size)
    }

    fn free(&self, off: OffsetPtr, size: usize) {
        if off.is_null() {
            return;
        }
        self.free_routed(off, size);
    }
}

unsafe impl Send for MpAllocator {}
unsafe impl Sync for MpAllocator {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MallocBackend, MemoryBackendId};

    fn test_mp(size: usize) -> (MallocBackend, MpAllocator) {
        let backend = MallocBackend::create(MemoryBackendId(0), size).unwrap();
        let mp = MpAllocator::create(AllocatorId::new(0, 0), backend.data_region());
        (backend, mp)
    }

    #[test]
    fn test_allocate_free_round_trip() {
        let (_backend, mp) = test_mp(32 << 20);
        let a = mp.allocate(4096);
        assert!(!a.is_null());
        // SAFETY: a is a live allocation.
        unsafe {
            std::ptr::write_bytes(mp.resolve(a), 0xCD, 4096);
            assert_eq!(*mp.resolve(a), 0xCD);
        }
        mp.free(a, 4096);
        let b = mp.allocate(4096);
        assert_eq!(a, b, "freed block is reused on the fast path");
    }

    #[test]
    fn test_zero_size_is_null() {
        let (_backend, mp) = test_mp(32 << 20);
        assert!(mp.allocate(0).is_null());
    }

    #[test]
    fn test_process_block_registered_once() {
        let (_backend, mp) = test_mp(32 << 20);
        mp.allocate(64);
        mp.allocate(64);
        assert_eq!(mp.process_count(), 1);
    }

    #[test]
    fn test_per_thread_blocks_disjoint() {
        use std::sync::Arc;

        let (backend, mp) = test_mp(64 << 20);
        let _keep = backend;
        let mp = Arc::new(mp);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mp = mp.clone();
            handles.push(std::thread::spawn(move || {
                let mut offs = Vec::new();
                for _ in 0..256 {
                    let off = mp.allocate(1024);
                    assert!(!off.is_null());
                    offs.push(off.get());
                }
                for off in &offs {
                    mp.free(OffsetPtr::new(*off), 1024);
                }
                offs
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4 * 256, "concurrent allocations never alias");
    }

    #[test]
    fn test_larger_than_thread_unit_falls_through() {
        let (_backend, mp) = test_mp(64 << 20);
        let unit = mp.thread_unit();
        let off = mp.allocate(unit as usize * 2);
        assert!(!off.is_null());
        mp.free(off, unit as usize * 2);
    }

    #[test]
    fn test_cross_thread_free() {
        let (backend, mp) = test_mp(32 << 20);
        let _keep = backend;
        let off = mp.allocate(2048);
        assert!(!off.is_null());

        // Free from a different thread; routing finds the owning block.
        let mp2 = mp;
        std::thread::spawn(move || {
            mp2.free(off, 2048);
        })
        .join()
        .unwrap();

        let again = mp.allocate(2048);
        assert_eq!(off, again);
    }

    #[test]
    fn test_release_process_block() {
        let (_backend, mp) = test_mp(32 << 20);
        let a = mp.allocate(128);
        mp.free(a, 128);
        assert_eq!(mp.process_count(), 1);
        mp.release_process_block();
        assert_eq!(mp.process_count(), 0);
        // A later allocation re-registers transparently.
        let b = mp.allocate(128);
        assert!(!b.is_null());
        assert_eq!(mp.process_count(), 1);
    }

    #[test]
    fn test_attach_shares_header() {
        let (backend, mp) = test_mp(32 << 20);
        let a = mp.allocate(512);
        assert!(!a.is_null());

        let attached = MpAllocator::attach(AllocatorId::new(0, 0), backend.data_region())
            .expect("attach over an initialized region");
        assert_eq!(attached.process_count(), 1);
        let b = attached.allocate(512);
        assert!(!b.is_null());
        assert_ne!(a, b);
        attached.free(b, 512);
        mp.free(a, 512);
    }
}
