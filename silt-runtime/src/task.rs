//! # Task Record
//!
//! The shared-memory task record: identity, routing, arguments, result and
//! the completion flag. Tasks are allocated from the shared allocator by the
//! submitting thread, mutated by the owning worker while running, completed
//! exactly once, and reaped by the waiter after it observes completion.
//!
//! Cooperative suspension (`yield_with`, `wait`) delegates to the run
//! context of the currently executing fiber; outside a worker it degrades to
//! an OS-yield spin, so the same code runs in clients and in task methods.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use silt_shm::ShmPtr;

use crate::run_context;
use crate::types::{MethodId, PoolId, TaskId};

/// Inline argument capacity; larger payloads go through the bulk pointer.
pub const TASK_INLINE_ARGS: usize = 64;

/// Result code: success.
pub const RC_OK: i32 = 0;
/// Result code: the task was cancelled at a suspension point.
pub const RC_CANCELLED: i32 = -2;
/// Result code: no method registered for the task's (kind, method).
pub const RC_UNKNOWN_METHOD: i32 = -3;
/// Result code: the destination pool is not registered.
pub const RC_UNKNOWN_POOL: i32 = -4;
/// Result code: the method panicked.
pub const RC_TASK_PANIC: i32 = -5;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    /// Storage allocated, fields being filled in.
    Allocated = 0,
    /// Pushed onto a lane, awaiting dequeue.
    Enqueued = 1,
    /// Executing on a worker fiber.
    Running = 2,
    /// Parked in a worker's blocked set.
    Blocked = 3,
    /// Completion flag published.
    Complete = 4,
    /// Storage returned to the allocator.
    Reaped = 5,
}

impl TaskState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => TaskState::Allocated,
            1 => TaskState::Enqueued,
            2 => TaskState::Running,
            3 => TaskState::Blocked,
            4 => TaskState::Complete,
            _ => TaskState::Reaped,
        }
    }
}

/// Shared-memory task record.
#[repr(C)]
pub struct Task {
    /// Task identity.
    pub task_id: TaskId,
    /// Destination pool.
    pub pool_id: PoolId,
    /// Method to invoke.
    pub method: MethodId,
    /// Routing hint; the submitter maps it onto a lane.
    pub lane_hint: u32,
    /// Priority level.
    pub prio: u32,

    state: AtomicU32,
    complete: AtomicU32,
    cancel: AtomicU32,
    ret_code: AtomicI32,

    /// This record's own location, so a task can hand out process-independent
    /// references to itself (dependency edges, reaping).
    self_ptr: ShmPtr,

    /// Inline argument bytes.
    args: [u8; TASK_INLINE_ARGS],
    args_len: u32,
    _pad: u32,
    /// Bulk argument region, when the payload exceeds the inline capacity.
    pub bulk_args: ShmPtr,
    /// Bulk argument length in bytes.
    pub bulk_len: u64,

    /// Telemetry: bytes of I/O this task will perform.
    pub io_size: u64,
    /// Telemetry: microseconds of compute this task will perform.
    pub compute_us: u64,
}

impl Task {
    /// Initialize a freshly allocated record in place.
    ///
    /// # Safety
    /// `ptr` must point at live, properly aligned storage for a `Task`.
    pub unsafe fn init_at(
        ptr: *mut Task,
        self_ptr: ShmPtr,
        task_id: TaskId,
        pool_id: PoolId,
        method: MethodId,
        lane_hint: u32,
        prio: u32,
        args: &[u8],
    ) {
        debug_assert!(args.len() <= TASK_INLINE_ARGS);
        let task = &mut *ptr;
        task.task_id = task_id;
        task.pool_id = pool_id;
        task.method = method;
        task.lane_hint = lane_hint;
        task.prio = prio;
        task.state = AtomicU32::new(TaskState::Allocated as u32);
        task.complete = AtomicU32::new(0);
        task.cancel = AtomicU32::new(0);
        task.ret_code = AtomicI32::new(RC_OK);
        task.self_ptr = self_ptr;
        task.args = [0; TASK_INLINE_ARGS];
        task.args[..args.len()].copy_from_slice(args);
        task.args_len = args.len() as u32;
        task._pad = 0;
        task.bulk_args = ShmPtr::null();
        task.bulk_len = 0;
        task.io_size = 0;
        task.compute_us = 0;
    }

    /// The inline argument bytes.
    pub fn args(&self) -> &[u8] {
        &self.args[..self.args_len as usize]
    }

    /// This record's own shared-memory location.
    pub fn self_ptr(&self) -> ShmPtr {
        self.self_ptr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle state.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// The completion flag (for cooperative waits).
    pub fn completion_flag(&self) -> &AtomicU32 {
        &self.complete
    }

    /// Whether completion has been published.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire) != 0
    }

    /// The result code. Meaningful once [`Self::is_complete`] returns true.
    pub fn result_code(&self) -> i32 {
        self.ret_code.load(Ordering::Acquire)
    }

    /// Store a result code without publishing completion. Methods use this
    /// to stage their result before returning.
    pub fn set_result(&self, code: i32) {
        self.ret_code.store(code, Ordering::Release);
    }

    /// Publish completion: write the result code, then release-store the
    /// completion flag so a waiter's acquire load observes the code.
    ///
    /// Single-completion is an invariant: publishing twice is a bug in the
    /// caller, surfaced by a debug assertion.
    pub fn signal_complete(&self, code: i32) {
        self.ret_code.store(code, Ordering::Release);
        self.set_state(TaskState::Complete);
        let prev = self.complete.swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "task {} completed twice", self.task_id);
    }

    /// Request cooperative cancellation. The task completes with
    /// [`RC_CANCELLED`] at its next suspension point.
    pub fn request_cancel(&self) {
        self.cancel.store(1, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire) != 0
    }

    /// Estimated CPU time in microseconds, used to order ready tasks:
    /// `io_size / 4 GiB·s⁻¹ + compute_us + 5`.
    pub fn est_cpu_time(&self) -> u64 {
        let io_time_us = (self.io_size as u128 * 1_000_000 / 4_294_967_296u128) as u64;
        io_time_us + self.compute_us + 5
    }

    /// Cooperatively suspend the running task for roughly `block_time_us`.
    ///
    /// Only meaningful on a worker fiber; elsewhere it degrades to an OS
    /// yield.
    pub fn yield_with(&self, block_time_us: u64) {
        run_context::yield_current(block_time_us);
    }

    /// Cooperatively wait until `flag` becomes non-zero, yielding between
    /// polls. On a worker fiber the waited-on task is recorded in the
    /// current run context's waiting-for set so the worker's dependency
    /// accounting stays correct; elsewhere this spins with an OS yield.
    pub fn wait(&self, flag: &AtomicU32, block_time_us: u64) {
        run_context::wait_current(self, flag, block_time_us);
    }
}
