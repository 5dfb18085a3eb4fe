//! # Silt Shared-Memory Substrate
//!
//! The memory layer the Silt runtime is built on, layered as
//! backends → allocators → containers:
//!
//! - **Backends** ([`backend`]): attachable regions with a per-process
//!   private prefix, a cross-process header carrying the owner flag, and a
//!   page-aligned data tail.
//! - **Allocators** ([`arena`], [`buddy`], [`mp`]): policies over a backend's
//!   data region that hand out offsets. The hierarchical [`mp::MpAllocator`]
//!   composes per-thread and per-process buddy pools over a global one for a
//!   lock-free fast path.
//! - **Containers** ([`pre`], [`ring`], [`multi_ring`]): process-shared
//!   structures storing offset pointers only, valid in every attached
//!   process.
//!
//! Plus the ambient pieces the layers above lean on: offset pointers
//! ([`ptr`]), the shared-memory spin lock ([`lock`]), the bump heap
//! ([`heap`]), and leveled logging ([`log`]).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod backend;
pub mod buddy;
pub mod error;
pub mod heap;
pub mod lock;
pub mod log;
pub mod mp;
pub mod multi_ring;
pub mod pre;
pub mod ptr;
pub mod ring;

// Re-exports
pub use arena::ArenaAllocator;
pub use backend::{MallocBackend, MemoryBackendId, PosixShmBackend, BACKEND_PRIVATE_SIZE};
pub use buddy::BuddyAllocator;
pub use error::{ShmError, ShmResult};
pub use heap::Heap;
pub use lock::{SpinGuard, SpinLock};
pub use mp::MpAllocator;
pub use multi_ring::{MultiMpscRingBuffer, MultiRingBuffer};
pub use ptr::{Allocator, AllocatorId, FullPtr, MemRegion, MemResolver, OffsetPtr, ShmPtr};
pub use ring::{ExtRingBuffer, MpscRingBuffer, RingBuffer, SpscRingBuffer};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
