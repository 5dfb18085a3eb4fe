//! # Runtime Context
//!
//! The explicit handle that replaces every would-be singleton: it owns the
//! backend, the hierarchical allocator, the task queue, the pool directory,
//! the method registry and the orchestrator, and passes them to components
//! by value or id rather than through globals.
//!
//! The shared data region is laid out as: a small superblock publishing the
//! queue and pool-directory offsets, then the allocator's domain (its
//! header, the task queue, the pool directory, and every task and container
//! allocated on demand). All cross-process references are offsets.
//!
//! Two construction modes mirror the backend split: [`Runtime::create`]
//! builds the region and may run workers; [`Runtime::attach`] joins an
//! existing region as a client that submits tasks and waits on futures.
//! Priority values are ordered ascending: the highest value dequeues first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use silt_shm::{
    log, Allocator, AllocatorId, FullPtr, MallocBackend, MemRegion, MemResolver, MemoryBackendId,
    MpAllocator, OffsetPtr, PosixShmBackend, ShmError, ShmPtr,
};

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::future::Future;
use crate::orchestrator::Orchestrator;
use crate::pool::PoolManager;
use crate::registry::MethodRegistry;
use crate::task::{Task, TaskState, RC_OK};
use crate::task_queue::{QueueEntry, TaskQueue};
use crate::types::{
    next_task_id, LaneId, MethodId, PoolId, ADMIN_POOL_ID, ADMIN_POOL_KIND, METHOD_FLUSH,
    METHOD_STOP_RUNTIME, METHOD_WATCHDOG,
};

/// Superblock magic ("SILTRTS1").
const SUPERBLOCK_MAGIC: u64 = 0x53494c5452545331;

/// Fixed-size block at the front of the data region publishing where the
/// shared structures live.
#[repr(C)]
struct Superblock {
    magic: u64,
    queue_off: AtomicU64,
    pools_off: AtomicU64,
}

/// Bytes reserved for the superblock.
const SUPERBLOCK_SIZE: u64 = 64;

/// The backing region, server- or test-flavored.
enum BackendHandle {
    Posix(PosixShmBackend),
    Malloc(MallocBackend),
}

impl BackendHandle {
    fn data_region(&self) -> MemRegion {
        match self {
            BackendHandle::Posix(b) => b.data_region(),
            BackendHandle::Malloc(b) => b.data_region(),
        }
    }
}

/// The runtime context.
pub struct Runtime {
    config: RuntimeConfig,
    backend: BackendHandle,
    alloc: MpAllocator,
    queue: TaskQueue,
    pools: PoolManager,
    registry: Arc<MethodRegistry>,
    /// Present in server mode only.
    orchestrator: Option<Mutex<Orchestrator>>,
}

impl Runtime {
    /// Create the runtime over a fresh POSIX shared-memory backend.
    pub fn create(config: RuntimeConfig) -> RuntimeResult<Self> {
        log::init_from_env();
        let backend = PosixShmBackend::create(
            MemoryBackendId(config.memory.backend_id),
            config.memory.shm_size,
            &config.memory.shm_url,
        )?;
        Self::build(config, BackendHandle::Posix(backend))
    }

    /// Create the runtime over an anonymous in-process backend. Used by
    /// tests and embeddings that do not need cross-process clients.
    pub fn create_in_process(config: RuntimeConfig) -> RuntimeResult<Self> {
        log::init_from_env();
        let backend = MallocBackend::create(
            MemoryBackendId(config.memory.backend_id),
            config.memory.shm_size,
        )?;
        Self::build(config, BackendHandle::Malloc(backend))
    }

    fn build(config: RuntimeConfig, backend: BackendHandle) -> RuntimeResult<Self> {
        let region = backend.data_region();
        let super_ptr = region.base() as *mut Superblock;

        let alloc_region = MemRegion::new(region.base(), SUPERBLOCK_SIZE, region.end);
        let alloc = MpAllocator::create(
            AllocatorId::new(config.memory.backend_id, 0),
            alloc_region,
        );

        let scheduler = &config.scheduler;
        let queue = TaskQueue::create(
            &alloc,
            scheduler.num_lanes as u64,
            scheduler.num_prios as u64,
            scheduler.queue_depth as u64,
        )?;
        let pools = PoolManager::create(&alloc)?;

        // Publish the layout for attaching clients.
        // SAFETY: the superblock area is reserved ahead of the allocator.
        unsafe {
            (*super_ptr).queue_off = AtomicU64::new(queue.offset().get());
            (*super_ptr).pools_off = AtomicU64::new(pools.offset().get());
            (*super_ptr).magic = SUPERBLOCK_MAGIC;
        }

        let registry = Arc::new(MethodRegistry::new());
        let orchestrator = Orchestrator::new(
            queue,
            alloc,
            pools,
            registry.clone(),
            scheduler.num_workers,
            scheduler.stacks_per_worker,
            config.shutdown.grace_period_ms,
        );

        let runtime = Self {
            config,
            backend,
            alloc,
            queue,
            pools,
            registry,
            orchestrator: Some(Mutex::new(orchestrator)),
        };
        runtime.register_admin_pool()?;
        Ok(runtime)
    }

    /// Attach to an existing runtime region as a client.
    pub fn attach(config: RuntimeConfig) -> RuntimeResult<Self> {
        log::init_from_env();
        let backend = PosixShmBackend::attach(&config.memory.shm_url)?;
        let region = backend.data_region();
        let super_ptr = region.base() as *const Superblock;
        // SAFETY: the creating process wrote the superblock before clients
        // could resolve the URL.
        let (magic, queue_off, pools_off) = unsafe {
            (
                (*super_ptr).magic,
                (*super_ptr).queue_off.load(Ordering::Acquire),
                (*super_ptr).pools_off.load(Ordering::Acquire),
            )
        };
        if magic != SUPERBLOCK_MAGIC {
            return Err(RuntimeError::Shm(ShmError::NotFound));
        }

        let alloc_region = MemRegion::new(region.base(), SUPERBLOCK_SIZE, region.end);
        let alloc = MpAllocator::attach(
            AllocatorId::new(config.memory.backend_id, 0),
            alloc_region,
        )
        .ok_or(RuntimeError::Shm(ShmError::NotFound))?;

        let queue = TaskQueue::attach(&alloc, OffsetPtr::new(queue_off));
        let pools = PoolManager::attach(&alloc, OffsetPtr::new(pools_off));

        Ok(Self {
            config,
            backend: BackendHandle::Posix(backend),
            alloc,
            queue,
            pools,
            registry: Arc::new(MethodRegistry::new()),
            orchestrator: None,
        })
    }

    /// The admin pool and its built-in methods.
    fn register_admin_pool(&self) -> RuntimeResult<()> {
        self.pools
            .register_pool(ADMIN_POOL_ID, ADMIN_POOL_KIND, "admin")?;

        let stop_flag = self
            .orchestrator
            .as_ref()
            .map(|o| o.lock().stop_flag())
            .expect("admin pool is registered in server mode only");
        self.registry
            .register_method(ADMIN_POOL_KIND, METHOD_STOP_RUNTIME, move |_ctx, task| {
                log::info("admin: stop requested");
                stop_flag.store(true, Ordering::Release);
                task.set_result(RC_OK);
            });

        self.registry
            .register_method(ADMIN_POOL_KIND, METHOD_FLUSH, |_ctx, task| {
                task.set_result(RC_OK);
            });

        // Watchdog: cancel a target task once the wall clock passes the
        // deadline. Arguments: target offset (u64), deadline in ms (u64).
        let alloc = self.alloc;
        self.registry
            .register_method(ADMIN_POOL_KIND, METHOD_WATCHDOG, move |ctx, task| {
                let args = task.args();
                if args.len() < 16 {
                    task.set_result(RC_OK);
                    return;
                }
                let target_off = u64::from_le_bytes(args[0..8].try_into().unwrap());
                let deadline_ms = u64::from_le_bytes(args[8..16].try_into().unwrap());
                let target = alloc.resolve_t::<Task>(OffsetPtr::new(target_off));
                let deadline = std::time::Instant::now()
                    + std::time::Duration::from_millis(deadline_ms);
                loop {
                    // SAFETY: the watchdog's submitter keeps the target
                    // alive until the watchdog completes.
                    let target_ref = unsafe { &*target };
                    if target_ref.is_complete() {
                        break;
                    }
                    if std::time::Instant::now() >= deadline {
                        target_ref.request_cancel();
                        break;
                    }
                    ctx.yield_with(1000);
                }
                task.set_result(RC_OK);
            });
        Ok(())
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The shared allocator.
    pub fn allocator(&self) -> &MpAllocator {
        &self.alloc
    }

    /// The task queue.
    pub fn task_queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// The pool directory.
    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    /// The method registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Start the workers. Idempotent under a one-shot guard; returns false
    /// when already started or in client mode.
    pub fn start(&self) -> bool {
        match &self.orchestrator {
            Some(orch) => orch.lock().start(),
            None => false,
        }
    }

    /// Whether the workers are running.
    pub fn is_running(&self) -> bool {
        self.orchestrator
            .as_ref()
            .map(|o| o.lock().is_running())
            .unwrap_or(false)
    }

    /// Stop the workers with the configured grace period.
    pub fn stop(&self) {
        if let Some(orch) = &self.orchestrator {
            orch.lock().stop();
        }
    }

    /// Submit a task: allocate the record from the shared allocator, route
    /// it to `lane_hint % num_lanes`, and wake the owning worker.
    pub fn enqueue(
        &self,
        pool: PoolId,
        lane_hint: u32,
        prio: u32,
        method: MethodId,
        args: &[u8],
    ) -> RuntimeResult<Future> {
        self.pools.kind_of(pool)?;

        let off = self.alloc.allocate(std::mem::size_of::<Task>());
        if off.is_null() {
            return Err(RuntimeError::Shm(ShmError::OutOfMemory));
        }
        let shm = ShmPtr::new(self.alloc.id(), off);
        let ptr = self.alloc.resolve_t::<Task>(off);
        let task_id = next_task_id();
        // SAFETY: the allocation is live and sized for a Task.
        unsafe {
            Task::init_at(ptr, shm, task_id, pool, method, lane_hint, prio, args);
        }
        let task = FullPtr::new(ptr, shm);
        // SAFETY: just initialized above.
        unsafe { task.get() }.set_state(TaskState::Enqueued);

        let lane = LaneId(lane_hint % self.queue.num_lanes() as u32);
        let prio = prio.min(self.queue.num_prios() as u32 - 1);
        if let Err(e) = self.queue.enqueue(lane, prio, QueueEntry { task: shm, task_id }) {
            self.alloc.free(off, std::mem::size_of::<Task>());
            return Err(e);
        }
        Ok(Future::new(task))
    }

    /// Free a completed task's record.
    pub fn reap(&self, future: Future) {
        future.reap(&self.alloc);
    }

    /// Submit a watchdog that cancels `target`'s task when `deadline_ms`
    /// elapses before it completes. Cancellation does not propagate to the
    /// target's children.
    pub fn spawn_watchdog(&self, target: &Future, deadline_ms: u64) -> RuntimeResult<Future> {
        let mut args = [0u8; 16];
        args[0..8].copy_from_slice(&target.task().off().get().to_le_bytes());
        args[8..16].copy_from_slice(&deadline_ms.to_le_bytes());
        self.enqueue(ADMIN_POOL_ID, 0, 0, METHOD_WATCHDOG, &args)
    }

    /// Submit the admin stop task: the admin lane drains up to it, then the
    /// orchestrator's stop flag is set. Fire-and-forget.
    pub fn submit_stop(&self) -> RuntimeResult<Future> {
        self.enqueue(ADMIN_POOL_ID, 0, 0, METHOD_STOP_RUNTIME, &[])
    }

    /// Hand backend cleanup responsibility to this process.
    pub fn take_ownership(&mut self) -> RuntimeResult<()> {
        match &mut self.backend {
            BackendHandle::Posix(b) => Ok(b.set_owner()?),
            BackendHandle::Malloc(_) => Ok(()),
        }
    }

    /// Give up backend cleanup responsibility.
    pub fn release_ownership(&mut self) -> RuntimeResult<()> {
        match &mut self.backend {
            BackendHandle::Posix(b) => Ok(b.unset_owner()?),
            BackendHandle::Malloc(_) => Ok(()),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
        self.alloc.release_process_block();
    }
}
