//! # Buddy Allocator
//!
//! Classical buddy allocation over a shared-memory region: a free list per
//! power-of-two size class, block splitting on allocation, sibling
//! coalescing on free, and bump-heap extension when every list runs dry.
//!
//! The class set is split into two banks the way the size distribution
//! splits: a round-up bank for small classes (2^5 … 2^14, where requests are
//! rounded up to the next class) and a round-down bank for large classes
//! (2^15 … 2^20). Requests above the top class are carved straight from the
//! heap and decompose into class blocks when freed.
//!
//! Blocks are born size-aligned, and splitting preserves alignment, so the
//! buddy of a block is always `offset XOR size`. Blocks adopted from foreign
//! extents (see [`BuddyAllocator::adopt_extent`]) may be unaligned; the
//! alignment guard simply skips coalescing for them.
//!
//! Concurrency: the heap pointer is atomic; one spin lock guards the free
//! lists.

use crate::heap::{align_up, Heap};
use crate::lock::SpinLock;
use crate::log;
use crate::ptr::{Allocator, AllocatorId, FullPtr, MemRegion, MemResolver, OffsetPtr, ShmPtr};
use crate::pre::slist::{Slist, SlistNode};

/// Smallest class: 2^5 = 32 bytes.
pub const BUDDY_MIN_SHIFT: u32 = 5;
/// Largest class: 2^20 = 1 MiB.
pub const BUDDY_MAX_SHIFT: u32 = 20;
/// Round-up bank covers 2^5 … 2^14.
pub const BUDDY_ROUND_UP_CLASSES: usize = 10;
/// Round-down bank covers 2^15 … 2^20.
pub const BUDDY_ROUND_DOWN_CLASSES: usize = 6;
/// Total class count.
pub const BUDDY_NUM_CLASSES: usize = BUDDY_ROUND_UP_CLASSES + BUDDY_ROUND_DOWN_CLASSES;
/// Largest class block size.
pub const BUDDY_MAX_BLOCK: u64 = 1 << BUDDY_MAX_SHIFT;
/// Smallest class block size.
pub const BUDDY_MIN_BLOCK: u64 = 1 << BUDDY_MIN_SHIFT;

/// Link written into the first bytes of every free block.
#[repr(C)]
pub struct FreeNode {
    next: OffsetPtr,
}

impl SlistNode for FreeNode {
    fn next(&self) -> OffsetPtr {
        self.next
    }
    fn set_next(&mut self, next: OffsetPtr) {
        self.next = next;
    }
}

/// Shared-memory state of a buddy allocator, placed at the front of its
/// region so every attached process manipulates the same lists.
#[repr(C)]
pub struct BuddyHeader {
    lock: SpinLock,
    _pad: u32,
    heap: Heap,
    /// Bytes handed out by the heap as blocks (alignment padding excluded).
    extended: std::sync::atomic::AtomicU64,
    lists: [Slist<FreeNode>; BUDDY_NUM_CLASSES],
}

impl BuddyHeader {
    /// Bytes the header occupies at the front of the region.
    pub fn size() -> u64 {
        align_up(std::mem::size_of::<BuddyHeader>() as u64, 64)
    }
}

/// Process-local handle to a buddy allocator.
#[derive(Clone, Copy)]
pub struct BuddyAllocator {
    id: AllocatorId,
    region: MemRegion,
    header: *mut BuddyHeader,
}

/// Class index for a request of `size` bytes, or `None` above the top class.
fn class_of(size: u64) -> Option<usize> {
    if size > BUDDY_MAX_BLOCK {
        return None;
    }
    let rounded = size.max(BUDDY_MIN_BLOCK).next_power_of_two();
    Some((rounded.trailing_zeros() - BUDDY_MIN_SHIFT) as usize)
}

/// Block size of a class.
fn class_size(class: usize) -> u64 {
    1u64 << (class as u32 + BUDDY_MIN_SHIFT)
}

impl BuddyAllocator {
    /// Initialize a new buddy allocator over `region`.
    pub fn create(id: AllocatorId, region: MemRegion) -> Self {
        // SAFETY: the region is a live mapping large enough for the header.
        let header = unsafe { region.base().add(region.start as usize) } as *mut BuddyHeader;
        let heap_origin = align_up(region.start + BuddyHeader::size(), 64).max(64);
        unsafe {
            (*header).lock.init();
            (*header).heap.init(heap_origin, region.end);
            (*header).extended = std::sync::atomic::AtomicU64::new(0);
            for list in (*header).lists.iter_mut() {
                list.init();
            }
        }
        Self { id, region, header }
    }

    /// Attach to a buddy allocator previously created over `region`.
    pub fn attach(id: AllocatorId, region: MemRegion) -> Self {
        // SAFETY: create placed the header at the front of the region.
        let header = unsafe { region.base().add(region.start as usize) } as *mut BuddyHeader;
        Self { id, region, header }
    }

    fn header(&self) -> &BuddyHeader {
        // SAFETY: create/attach pointed this at a live header.
        unsafe { &*self.header }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut BuddyHeader {
        // SAFETY: list mutation happens only under the header spin lock.
        unsafe { &mut *self.header }
    }

    fn free_node(&self, off: OffsetPtr) -> FullPtr<FreeNode> {
        FullPtr::new(
            self.region.resolve_t::<FreeNode>(off),
            ShmPtr::new(self.id, off),
        )
    }

    /// Pop a block of exactly `class`, or split one down from a larger
    /// class. Caller holds the lock.
    fn take_class(&self, class: usize) -> OffsetPtr {
        let header = self.header_mut();
        let node = header.lists[class].pop_front(&self.region);
        if !node.is_null() {
            return node.off();
        }
        // Split from the smallest larger non-empty class.
        for upper in (class + 1)..BUDDY_NUM_CLASSES {
            let node = header.lists[upper].pop_front(&self.region);
            if node.is_null() {
                continue;
            }
            let off = node.off();
            let mut level = upper;
            while level > class {
                level -= 1;
                let sibling = off.add(class_size(level));
                header.lists[level].emplace_front(&self.region, self.free_node(sibling));
            }
            return off;
        }
        OffsetPtr::NULL
    }

    /// Push a block, coalescing with its buddy while possible.
    /// Caller holds the lock.
    fn put_class(&self, mut off: OffsetPtr, mut class: usize) {
        loop {
            let size = class_size(class);
            // Blocks born from foreign extents may be unaligned; they are
            // reusable but never coalesce.
            let aligned = off.get() % size == 0;
            if !aligned || class + 1 >= BUDDY_NUM_CLASSES {
                break;
            }
            let buddy = OffsetPtr::new(off.get() ^ size);
            if !self.list_remove(class, buddy) {
                break;
            }
            off = OffsetPtr::new(off.get().min(buddy.get()));
            class += 1;
        }
        // A block already present in its class list is a double free.
        if self.list_contains(class, off) {
            log::fatal(&format!(
                "buddy allocator {}: double free of offset {:#x} (class {})",
                self.id,
                off.get(),
                class
            ));
        }
        self.header_mut().lists[class].emplace_front(&self.region, self.free_node(off));
    }

    /// Remove a specific offset from a class list. Caller holds the lock.
    fn list_remove(&self, class: usize, off: OffsetPtr) -> bool {
        let header = self.header_mut();
        let mut it = header.lists[class].iter(&self.region);
        loop {
            let node = it.next_node();
            if node.is_null() {
                return false;
            }
            if node.off() == off {
                header.lists[class].pop_at(&self.region, &it);
                return true;
            }
        }
    }

    /// Whether a class list holds `off`. Caller holds the lock.
    fn list_contains(&self, class: usize, off: OffsetPtr) -> bool {
        let header = self.header_mut();
        let mut it = header.lists[class].iter(&self.region);
        loop {
            let node = it.next_node();
            if node.is_null() {
                return false;
            }
            if node.off() == off {
                return true;
            }
        }
    }

    /// Decompose `[off, off + size)` into class blocks and push them.
    /// Remainders below the smallest class are dropped. Caller holds the lock.
    fn put_extent(&self, off: OffsetPtr, size: u64) {
        let mut cursor = off.get();
        let mut remaining = size;
        while remaining >= BUDDY_MIN_BLOCK {
            // Largest class block that fits the remainder.
            let block = (1u64 << (63 - remaining.leading_zeros())).min(BUDDY_MAX_BLOCK);
            self.put_class(OffsetPtr::new(cursor), class_of(block).unwrap());
            cursor += block;
            remaining -= block;
        }
    }

    /// Donate a foreign extent (memory allocated elsewhere in the same root
    /// region) to this allocator's free lists.
    pub fn adopt_extent(&self, off: OffsetPtr, size: u64) {
        if off.is_null() || size < BUDDY_MIN_BLOCK {
            return;
        }
        let _guard = self.header().lock.lock();
        self.put_extent(off, size);
    }

    /// Total bytes currently sitting in the free lists.
    pub fn free_bytes(&self) -> u64 {
        let _guard = self.header().lock.lock();
        let header = self.header();
        header
            .lists
            .iter()
            .enumerate()
            .map(|(c, list)| list.len() * class_size(c))
            .sum()
    }

    /// Bytes the heap has handed out as blocks so far (free or outstanding;
    /// alignment padding is not counted).
    pub fn reachable_bytes(&self) -> u64 {
        self.header()
            .extended
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// The region this allocator manages.
    pub fn region(&self) -> MemRegion {
        self.region
    }

    /// Whether `off` lies inside this allocator's heap range.
    pub fn owns(&self, off: OffsetPtr) -> bool {
        let header = self.header();
        let o = off.get();
        o >= header.heap.origin() && o < header.heap.limit()
    }
}

impl MemResolver for BuddyAllocator {
    fn base(&self) -> *mut u8 {
        self.region.base()
    }
}

impl Allocator for BuddyAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn allocate(&self, size: usize) -> OffsetPtr {
        let size = size as u64;
        if size == 0 {
            return OffsetPtr::NULL;
        }
        match class_of(size) {
            Some(class) => {
                {
                    let _guard = self.header().lock.lock();
                    let off = self.take_class(class);
                    if !off.is_null() {
                        return off;
                    }
                }
                // Lists dry: extend the heap with a size-aligned block so the
                // buddy relation (offset XOR size) holds for its lifetime.
                let block = class_size(class);
                let off = self.header().heap.allocate_aligned(block, block);
                if !off.is_null() {
                    self.header()
                        .extended
                        .fetch_add(block, std::sync::atomic::Ordering::AcqRel);
                }
                off
            }
            None => {
                // Above the top class: carve straight from the heap.
                let off = self.header().heap.allocate_aligned(size, 64);
                if !off.is_null() {
                    self.header()
                        .extended
                        .fetch_add(size, std::sync::atomic::Ordering::AcqRel);
                }
                off
            }
        }
    }

    fn free(&self, off: OffsetPtr, size: usize) {
        let size = size as u64;
        if off.is_null() || size == 0 {
            return;
        }
        let header = self.header();
        if off.get() < header.heap.origin() || off.get() + size > header.heap.offset() {
            log::fatal(&format!(
                "buddy allocator {}: invalid free of offset {:#x} size {}",
                self.id,
                off.get(),
                size
            ));
        }
        let _guard = header.lock.lock();
        match class_of(size) {
            Some(class) => self.put_class(off, class),
            None => self.put_extent(off, size),
        }
    }
}

unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}
