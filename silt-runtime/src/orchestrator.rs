//! # Orchestrator
//!
//! Owns the worker threads: assigns lanes round-robin at construction,
//! starts the workers under a one-shot guard, wakes them, and stops them
//! with a grace period. Lane-to-worker assignment is set once; rebalancing
//! a drained lane goes through [`crate::task_queue::TaskQueue::reassign`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use silt_shm::{log, MpAllocator};

use crate::pool::PoolManager;
use crate::registry::MethodRegistry;
use crate::signal::EventFd;
use crate::task_queue::TaskQueue;
use crate::types::{LaneId, WorkerId};
use crate::worker::{Worker, WorkerSpec};

/// Orchestrates the worker set over one task queue.
pub struct Orchestrator {
    queue: TaskQueue,
    alloc: MpAllocator,
    pools: PoolManager,
    registry: Arc<MethodRegistry>,
    /// Lanes each worker owns, indexed by worker.
    assignment: Vec<Vec<LaneId>>,
    stacks_per_worker: usize,
    grace: Duration,
    stop: Arc<AtomicBool>,
    started: AtomicBool,
    threads: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Build an orchestrator for `num_workers` workers over the queue's
    /// lanes, assigned round-robin.
    pub fn new(
        queue: TaskQueue,
        alloc: MpAllocator,
        pools: PoolManager,
        registry: Arc<MethodRegistry>,
        num_workers: usize,
        stacks_per_worker: usize,
        grace_period_ms: u64,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let mut assignment: Vec<Vec<LaneId>> = vec![Vec::new(); num_workers];
        for lane in 0..queue.num_lanes() {
            assignment[lane as usize % num_workers].push(LaneId(lane as u32));
        }
        Self {
            queue,
            alloc,
            pools,
            registry,
            assignment,
            stacks_per_worker,
            grace: Duration::from_millis(grace_period_ms),
            stop: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            threads: Vec::new(),
        }
    }

    /// Number of workers.
    pub fn num_workers(&self) -> usize {
        self.assignment.len()
    }

    /// The lanes assigned to `worker`.
    pub fn lanes_of(&self, worker: WorkerId) -> &[LaneId] {
        &self.assignment[worker.0 as usize]
    }

    /// The stop flag, shared with the admin stop method.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Whether the workers are running.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stop.load(Ordering::Acquire)
    }

    /// Start the worker threads. Idempotent: only the first call spawns.
    pub fn start(&mut self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        for (i, lanes) in self.assignment.iter().enumerate() {
            let spec = WorkerSpec {
                id: WorkerId(i as u32),
                lanes: lanes.clone(),
                queue: self.queue,
                alloc: self.alloc,
                pools: self.pools,
                registry: self.registry.clone(),
                stacks: self.stacks_per_worker,
                stop: self.stop.clone(),
                grace: self.grace,
            };
            let handle = std::thread::Builder::new()
                .name(format!("silt-worker-{}", i))
                .spawn(move || Worker::new(spec).run())
                .expect("failed to spawn worker thread");
            self.threads.push(handle);
        }
        log::info(&format!(
            "orchestrator started {} workers over {} lanes",
            self.num_workers(),
            self.queue.num_lanes()
        ));
        true
    }

    /// Wake one worker out of its idle wait.
    pub fn wake(&self, worker: WorkerId) {
        if let Some(lanes) = self.assignment.get(worker.0 as usize) {
            if let Some(lane) = lanes.first() {
                EventFd::signal_raw(self.queue.lane_header(*lane).wake_fd());
            }
        }
    }

    /// Wake every worker.
    pub fn wake_all(&self) {
        for i in 0..self.num_workers() {
            self.wake(WorkerId(i as u32));
        }
    }

    /// Stop the workers: set the stop flag, wake everyone, and join.
    ///
    /// Workers drain their lanes and blocked sets; tasks still outstanding
    /// when the grace period lapses are cancelled.
    pub fn stop(&mut self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.wake_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::info("orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}
