//! # Future
//!
//! A typed handle over a task's completion flag and result. Waiting from a
//! task method suspends the calling task cooperatively (and records the
//! dependency edge); waiting from a plain thread spins with OS yields.
//!
//! Dropping a future does not free the task: the record outlives the handle
//! until an explicit [`Future::reap`], so late completions never write into
//! recycled memory.

use silt_shm::{Allocator, FullPtr, MpAllocator};

use crate::task::Task;
use crate::types::TaskId;

/// Handle over a submitted task.
#[derive(Debug, Clone, Copy)]
pub struct Future {
    task: FullPtr<Task>,
}

impl Future {
    /// Wrap a task record.
    pub(crate) fn new(task: FullPtr<Task>) -> Self {
        Self { task }
    }

    /// The underlying task record.
    pub fn task(&self) -> FullPtr<Task> {
        self.task
    }

    /// Whether the handle is empty.
    pub fn is_null(&self) -> bool {
        self.task.is_null()
    }

    /// The task's identity.
    pub fn task_id(&self) -> TaskId {
        // SAFETY: the task is live until reaped.
        unsafe { self.task.get() }.task_id
    }

    /// Whether completion has been published.
    pub fn is_complete(&self) -> bool {
        // SAFETY: the task is live until reaped.
        unsafe { self.task.get() }.is_complete()
    }

    /// Non-blocking check: the result code once complete, `None` while
    /// pending.
    pub fn poll(&self) -> Option<i32> {
        // SAFETY: the task is live until reaped.
        let task = unsafe { self.task.get() };
        if task.is_complete() {
            Some(task.result_code())
        } else {
            None
        }
    }

    /// Block until the task completes and return its result code.
    ///
    /// On a worker fiber this suspends the calling task with
    /// `block_time_us` as its block hint; elsewhere it spins with OS
    /// yields. Waiting on an already-complete task returns immediately
    /// without touching any blocked set.
    pub fn wait(&self, block_time_us: u64) -> i32 {
        // SAFETY: the task is live until reaped.
        let task = unsafe { self.task.get() };
        task.wait(task.completion_flag(), block_time_us);
        task.result_code()
    }

    /// The result code. Only meaningful after completion; `None` before.
    pub fn result(&self) -> Option<i32> {
        self.poll()
    }

    /// Free the task record. The task must be complete; reaping a pending
    /// task would let the worker write into recycled memory.
    pub fn reap(self, alloc: &MpAllocator) {
        if self.task.is_null() {
            return;
        }
        // SAFETY: the record is live until this free.
        let task = unsafe { self.task.get() };
        debug_assert!(task.is_complete(), "reaping an incomplete task");
        task.set_state(crate::task::TaskState::Reaped);
        alloc.free(self.task.off(), std::mem::size_of::<Task>());
    }
}
