//! # Pool Manager
//!
//! Pools are named collections of containers keyed by [`PoolId`]; the
//! kernel's contract is delivery of tasks to `(pool, lane, method)`. The
//! manager keeps a shared-memory directory (a preallocated red-black tree of
//! pool records) so every attached process resolves the same pool set.

use silt_shm::pre::{RbLinks, RbNode, RbTree};
use silt_shm::{Allocator, MemResolver, MpAllocator, OffsetPtr, ShmError, ShmResult, SpinLock};

use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{PoolId, PoolKind};

/// Maximum pool name length stored in the directory.
pub const POOL_NAME_MAX: usize = 64;

/// One directory entry, keyed by the pool id.
#[repr(C)]
struct PoolRecord {
    links: RbLinks,
    kind: u32,
    name_len: u32,
    name: [u8; POOL_NAME_MAX],
}

impl RbNode for PoolRecord {
    fn links(&self) -> &RbLinks {
        &self.links
    }
    fn links_mut(&mut self) -> &mut RbLinks {
        &mut self.links
    }
}

/// Shared directory header.
#[repr(C)]
struct PoolDir {
    lock: SpinLock,
    _pad: u32,
    count: u64,
    tree: RbTree<PoolRecord>,
}

/// Process-local handle to the pool directory.
#[derive(Clone, Copy)]
pub struct PoolManager {
    alloc: MpAllocator,
    off: OffsetPtr,
    dir: *mut PoolDir,
}

impl PoolManager {
    /// Build an empty directory in shared memory.
    pub fn create(alloc: &MpAllocator) -> ShmResult<Self> {
        let off = alloc.allocate(std::mem::size_of::<PoolDir>());
        if off.is_null() {
            return Err(ShmError::OutOfMemory);
        }
        let dir = alloc.resolve_t::<PoolDir>(off);
        // SAFETY: the allocation is live; initialize every field in place.
        unsafe {
            (*dir).lock.init();
            (*dir)._pad = 0;
            (*dir).count = 0;
            (*dir).tree.init();
        }
        Ok(Self {
            alloc: *alloc,
            off,
            dir,
        })
    }

    /// Attach to a directory created by another process.
    pub fn attach(alloc: &MpAllocator, off: OffsetPtr) -> Self {
        Self {
            alloc: *alloc,
            off,
            dir: alloc.resolve_t::<PoolDir>(off),
        }
    }

    /// The directory's offset (published through the superblock).
    pub fn offset(&self) -> OffsetPtr {
        self.off
    }

    fn dir(&self) -> &PoolDir {
        // SAFETY: create/attach pointed this at a live directory.
        unsafe { &*self.dir }
    }

    #[allow(clippy::mut_from_ref)]
    fn dir_mut(&self) -> &mut PoolDir {
        // SAFETY: tree mutation happens only under the directory lock.
        unsafe { &mut *self.dir }
    }

    /// Register a pool. Idempotent: re-registering an existing id is a
    /// no-op that keeps the original record.
    pub fn register_pool(&self, id: PoolId, kind: PoolKind, name: &str) -> RuntimeResult<()> {
        let dir = self.dir_mut();
        let _guard = dir.lock.lock();
        if !dir.tree.find(&self.alloc, id.0).is_null() {
            return Ok(());
        }

        let off = self.alloc.allocate(std::mem::size_of::<PoolRecord>());
        if off.is_null() {
            return Err(RuntimeError::Shm(ShmError::OutOfMemory));
        }
        let record = self.alloc.resolve_t::<PoolRecord>(off);
        let name_bytes = name.as_bytes();
        let name_len = name_bytes.len().min(POOL_NAME_MAX);
        // SAFETY: the allocation is live; initialize every field in place.
        unsafe {
            (*record).links = RbLinks::new(id.0);
            (*record).kind = kind.0;
            (*record).name_len = name_len as u32;
            (*record).name = [0; POOL_NAME_MAX];
            (&mut (*record).name)[..name_len].copy_from_slice(&name_bytes[..name_len]);
        }
        dir.tree
            .emplace(&self.alloc, self.alloc.full_ptr::<PoolRecord>(off));
        dir.count += 1;
        Ok(())
    }

    /// Drop a pool from the directory and free its record.
    pub fn unregister_pool(&self, id: PoolId) -> RuntimeResult<()> {
        let dir = self.dir_mut();
        let _guard = dir.lock.lock();
        let node = dir.tree.remove(&self.alloc, id.0);
        if node.is_null() {
            return Err(RuntimeError::UnknownPool(id));
        }
        dir.count -= 1;
        self.alloc
            .free(node.off(), std::mem::size_of::<PoolRecord>());
        Ok(())
    }

    /// The kind of a registered pool.
    pub fn kind_of(&self, id: PoolId) -> RuntimeResult<PoolKind> {
        let dir = self.dir_mut();
        let _guard = dir.lock.lock();
        let node = dir.tree.find(&self.alloc, id.0);
        if node.is_null() {
            return Err(RuntimeError::UnknownPool(id));
        }
        // SAFETY: directory nodes are live records.
        Ok(PoolKind(unsafe { node.get().kind }))
    }

    /// The name of a registered pool.
    pub fn name_of(&self, id: PoolId) -> RuntimeResult<String> {
        let dir = self.dir_mut();
        let _guard = dir.lock.lock();
        let node = dir.tree.find(&self.alloc, id.0);
        if node.is_null() {
            return Err(RuntimeError::UnknownPool(id));
        }
        // SAFETY: directory nodes are live records.
        let record = unsafe { node.get() };
        Ok(String::from_utf8_lossy(&record.name[..record.name_len as usize]).into_owned())
    }

    /// Number of registered pools.
    pub fn count(&self) -> u64 {
        self.dir().count
    }
}

unsafe impl Send for PoolManager {}
unsafe impl Sync for PoolManager {}
