//! Identity types for pools, tasks, workers, lanes and methods.
//!
//! All identities are plain value types: copyable, hashable, totally
//! ordered, and `repr(C)` where they cross the shared-memory boundary.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nix::libc;

/// Identity of a pool (the unit of task dispatch).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u64);

impl PoolId {
    /// The raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool:{}", self.0)
    }
}

/// The kind of a pool, selecting which method table applies to it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKind(pub u32);

/// Identity of a worker thread.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}

/// Identity of a queue lane.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId(pub u32);

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane:{}", self.0)
    }
}

/// Identity of a registered task method.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// Identity of a task: submitting process and thread, per-thread sequence,
/// replica index, and a process-wide unique counter.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    /// Submitting process.
    pub pid: u32,
    /// Submitting thread (runtime-assigned, not the OS tid).
    pub tid: u32,
    /// Per-thread submission sequence.
    pub seq: u32,
    /// Replica index for replicated submissions.
    pub replica: u32,
    /// Process-wide unique counter.
    pub unique: u64,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.pid, self.tid, self.seq, self.replica, self.unique
        )
    }
}

/// Process-wide unique task counter.
static NEXT_TASK_UNIQUE: AtomicU64 = AtomicU64::new(1);

/// Runtime-assigned submitting-thread ids.
static NEXT_SUBMIT_TID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static SUBMIT_STATE: std::cell::Cell<(u32, u32)> = std::cell::Cell::new((0, 0));
}

/// Mint a fresh task id for a submission from the current thread.
pub fn next_task_id() -> TaskId {
    // SAFETY: getpid never fails.
    let pid = unsafe { libc::getpid() } as u32;
    SUBMIT_STATE.with(|cell| {
        let (mut tid, mut seq) = cell.get();
        if tid == 0 {
            tid = NEXT_SUBMIT_TID.fetch_add(1, Ordering::Relaxed);
        }
        seq = seq.wrapping_add(1);
        cell.set((tid, seq));
        TaskId {
            pid,
            tid,
            seq,
            replica: 0,
            unique: NEXT_TASK_UNIQUE.fetch_add(1, Ordering::Relaxed),
        }
    })
}

/// The admin pool, registered at runtime startup.
pub const ADMIN_POOL_ID: PoolId = PoolId(1);
/// Kind of the admin pool.
pub const ADMIN_POOL_KIND: PoolKind = PoolKind(0);
/// Admin method: drain the admin pool, then stop the orchestrator.
pub const METHOD_STOP_RUNTIME: MethodId = MethodId(1);
/// Admin method: no-op barrier used to drain queues.
pub const METHOD_FLUSH: MethodId = MethodId(2);
/// Admin method: cancel a target task once a deadline passes.
pub const METHOD_WATCHDOG: MethodId = MethodId(3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_unique() {
        let a = next_task_id();
        let b = next_task_id();
        assert_ne!(a, b);
        assert!(b.unique > a.unique);
        assert_eq!(a.tid, b.tid);
        assert_eq!(b.seq, a.seq + 1);
    }

    #[test]
    fn test_task_ids_distinct_across_threads() {
        let a = next_task_id();
        let b = std::thread::spawn(next_task_id).join().unwrap();
        assert_ne!(a.tid, b.tid);
        assert_ne!(a.unique, b.unique);
    }

    #[test]
    fn test_identity_ordering() {
        assert!(PoolId(1) < PoolId(2));
        assert!(LaneId(0) < LaneId(1));
        assert!(WorkerId(3) > WorkerId(1));
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId {
            pid: 7,
            tid: 2,
            seq: 3,
            replica: 0,
            unique: 41,
        };
        assert_eq!(id.to_string(), "7.2.3.0.41");
    }
}
