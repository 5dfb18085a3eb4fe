//! # Offset Pointers
//!
//! Process-independent references into shared memory.
//!
//! Raw addresses are never stored inside a shared region: a mapping is placed
//! at a different virtual address in every attaching process. Instead the
//! containers and allocators store an [`OffsetPtr`] (a byte offset relative
//! to the owning allocator's region) and resolve it through the allocator on
//! each dereference. A [`FullPtr`] pairs the offset with the resolved address
//! for use within a single process.

use std::fmt;

/// Identity of an allocator: the backend it lives on plus a minor index for
/// sub-allocators carved out of the same backend.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId {
    /// Backend identity.
    pub backend: u32,
    /// Sub-allocator index within the backend (0 for the root allocator).
    pub minor: u32,
}

impl AllocatorId {
    /// Create an allocator id.
    pub const fn new(backend: u32, minor: u32) -> Self {
        Self { backend, minor }
    }

    /// The null allocator id.
    pub const fn null() -> Self {
        Self {
            backend: u32::MAX,
            minor: u32::MAX,
        }
    }

    /// Check for the null id.
    pub const fn is_null(&self) -> bool {
        self.backend == u32::MAX && self.minor == u32::MAX
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.backend, self.minor)
    }
}

/// A byte offset within an allocator's region.
///
/// Offset 0 is the null value. Allocators reserve the start of their region
/// for their own header, so no valid allocation ever begins at offset 0.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OffsetPtr(u64);

impl OffsetPtr {
    /// The null offset.
    pub const NULL: Self = Self(0);

    /// Create an offset pointer.
    pub const fn new(off: u64) -> Self {
        Self(off)
    }

    /// Get the raw offset.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Check for null.
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Offset arithmetic; null is absorbing.
    pub const fn add(&self, bytes: u64) -> Self {
        if self.is_null() {
            Self::NULL
        } else {
            Self(self.0 + bytes)
        }
    }
}

impl Default for OffsetPtr {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for OffsetPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// A process-independent pointer: allocator identity plus offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmPtr {
    /// The allocator that issued the offset.
    pub alloc: AllocatorId,
    /// The offset within that allocator's region.
    pub off: OffsetPtr,
}

impl ShmPtr {
    /// Create a shared-memory pointer.
    pub const fn new(alloc: AllocatorId, off: OffsetPtr) -> Self {
        Self { alloc, off }
    }

    /// The null pointer.
    pub const fn null() -> Self {
        Self {
            alloc: AllocatorId::null(),
            off: OffsetPtr::NULL,
        }
    }

    /// Check for null.
    pub const fn is_null(&self) -> bool {
        self.off.is_null()
    }
}

impl Default for ShmPtr {
    fn default() -> Self {
        Self::null()
    }
}

/// An offset pointer resolved to an address in the current process.
///
/// The resolved address is only meaningful inside the process that performed
/// the resolution; the embedded [`ShmPtr`] is the part that may be written
/// into shared memory or sent to another process.
pub struct FullPtr<T> {
    /// Process-local resolved address.
    pub ptr: *mut T,
    /// Process-independent pointer.
    pub shm: ShmPtr,
}

impl<T> FullPtr<T> {
    /// Create a full pointer from a resolved address and its shm pointer.
    pub fn new(ptr: *mut T, shm: ShmPtr) -> Self {
        Self { ptr, shm }
    }

    /// The null full pointer.
    pub fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            shm: ShmPtr::null(),
        }
    }

    /// Check for null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null() || self.shm.is_null()
    }

    /// The offset component.
    pub fn off(&self) -> OffsetPtr {
        self.shm.off
    }

    /// Borrow the pointee.
    ///
    /// # Safety
    /// The pointer must be non-null and resolved against a live mapping.
    pub unsafe fn get(&self) -> &T {
        &*self.ptr
    }

    /// Mutably borrow the pointee.
    ///
    /// # Safety
    /// The pointer must be non-null, resolved against a live mapping, and the
    /// caller must hold whatever lock the containing structure requires.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.ptr
    }

    /// Reinterpret the pointee type.
    pub fn cast<U>(&self) -> FullPtr<U> {
        FullPtr {
            ptr: self.ptr as *mut U,
            shm: self.shm,
        }
    }
}

impl<T> Clone for FullPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FullPtr<T> {}

impl<T> fmt::Debug for FullPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullPtr")
            .field("ptr", &self.ptr)
            .field("alloc", &self.shm.alloc)
            .field("off", &self.shm.off)
            .finish()
    }
}

// Full pointers reference shared mappings whose lifetime is managed by the
// backend, not by the pointer; ownership discipline is the containing
// structure's responsibility.
unsafe impl<T> Send for FullPtr<T> {}
unsafe impl<T> Sync for FullPtr<T> {}

/// Resolution of offsets to process-local addresses.
pub trait MemResolver {
    /// Base address of the region offsets are relative to.
    fn base(&self) -> *mut u8;

    /// Resolve an offset to an address; null maps to null.
    fn resolve(&self, off: OffsetPtr) -> *mut u8 {
        if off.is_null() {
            std::ptr::null_mut()
        } else {
            // SAFETY: offsets handed out by an allocator lie within its mapping.
            unsafe { self.base().add(off.get() as usize) }
        }
    }

    /// Resolve an offset to a typed pointer.
    fn resolve_t<T>(&self, off: OffsetPtr) -> *mut T {
        self.resolve(off) as *mut T
    }
}

/// The allocator contract: hand out offsets within a region and translate
/// them back to addresses.
pub trait Allocator: MemResolver {
    /// This allocator's identity.
    fn id(&self) -> AllocatorId;

    /// Allocate `size` bytes. Returns null on exhaustion and for `size == 0`.
    fn allocate(&self, size: usize) -> OffsetPtr;

    /// Return an allocation of `size` bytes at `off` to the allocator.
    fn free(&self, off: OffsetPtr, size: usize);

    /// Allocate, copy `old_size.min(new_size)` bytes, free the old block.
    fn reallocate(&self, off: OffsetPtr, old_size: usize, new_size: usize) -> OffsetPtr {
        let new_off = self.allocate(new_size);
        if new_off.is_null() || off.is_null() {
            return new_off;
        }
        let n = old_size.min(new_size);
        // SAFETY: both offsets were issued by this allocator and do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.resolve(off), self.resolve(new_off), n);
        }
        self.free(off, old_size);
        new_off
    }

    /// Allocate storage for a `T` and return it as a full pointer.
    /// The storage is uninitialized; the caller writes the value in place.
    fn allocate_obj<T>(&self) -> FullPtr<T> {
        let off = self.allocate(std::mem::size_of::<T>());
        self.full_ptr(off)
    }

    /// Build a full pointer from an offset issued by this allocator.
    fn full_ptr<T>(&self, off: OffsetPtr) -> FullPtr<T> {
        if off.is_null() {
            FullPtr::null()
        } else {
            FullPtr::new(self.resolve_t::<T>(off), ShmPtr::new(self.id(), off))
        }
    }
}

/// A bare (base, bounds) view of mapped memory, used while bootstrapping
/// allocators before a full allocator handle exists.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    /// Address of offset 0.
    pub base: *mut u8,
    /// First usable offset.
    pub start: u64,
    /// One past the last usable offset.
    pub end: u64,
}

impl MemRegion {
    /// Create a region view.
    pub fn new(base: *mut u8, start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { base, start, end }
    }

    /// Usable length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// A sub-region `[self.start + at, self.start + at + len)`.
    pub fn slice(&self, at: u64, len: u64) -> MemRegion {
        debug_assert!(self.start + at + len <= self.end);
        MemRegion::new(self.base, self.start + at, self.start + at + len)
    }
}

impl MemResolver for MemRegion {
    fn base(&self) -> *mut u8 {
        self.base
    }
}

unsafe impl Send for MemRegion {}
unsafe impl Sync for MemRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_ptr_null() {
        let p = OffsetPtr::NULL;
        assert!(p.is_null());
        assert!(p.add(64).is_null());

        let q = OffsetPtr::new(128);
        assert!(!q.is_null());
        assert_eq!(q.add(64).get(), 192);
    }

    #[test]
    fn test_shm_ptr_null() {
        assert!(ShmPtr::null().is_null());
        let p = ShmPtr::new(AllocatorId::new(1, 0), OffsetPtr::new(4096));
        assert!(!p.is_null());
        assert_eq!(p.alloc, AllocatorId::new(1, 0));
    }

    #[test]
    fn test_full_ptr_cast() {
        let mut word: u64 = 7;
        let p = FullPtr::new(
            &mut word as *mut u64,
            ShmPtr::new(AllocatorId::new(0, 0), OffsetPtr::new(8)),
        );
        let q = p.cast::<u32>();
        assert_eq!(q.off().get(), 8);
        assert!(!q.is_null());
    }

    #[test]
    fn test_region_resolve() {
        let mut buf = vec![0u8; 256];
        let region = MemRegion::new(buf.as_mut_ptr(), 0, 256);
        assert_eq!(region.resolve(OffsetPtr::NULL), std::ptr::null_mut());
        assert_eq!(region.resolve(OffsetPtr::new(16)), unsafe {
            buf.as_mut_ptr().add(16)
        });
        let sub = region.slice(64, 64);
        assert_eq!(sub.len(), 64);
        assert_eq!(sub.start, 64);
    }

    #[test]
    fn test_allocator_id_display() {
        assert_eq!(AllocatorId::new(3, 1).to_string(), "3.1");
        assert!(AllocatorId::null().is_null());
    }
}
