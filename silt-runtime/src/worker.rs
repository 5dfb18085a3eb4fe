//! # Worker
//!
//! One worker owns a disjoint set of lanes, a private run-queue of ready
//! tasks, a blocked set, and a pool of fiber carriers. The loop is
//! single-threaded and cooperative:
//!
//! 1. Drain the owned lanes, highest priority first, into the ready queue.
//! 2. Stable-sort ready by estimated CPU time and run each task on a
//!    carrier to its completion or first yield.
//! 3. Park yielded tasks in the blocked set; re-admit the ones whose
//!    condition is met (all waiting-for subtasks complete, block hint
//!    elapsed, or cancellation requested).
//! 4. When nothing made progress, sleep in `epoll_wait` over the lanes'
//!    wake-up descriptors.
//!
//! Workers never steal from each other; unbalanced lanes are a
//! configuration concern, not a runtime one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use silt_shm::{log, FullPtr, MemResolver, MpAllocator};

use crate::pool::PoolManager;
use crate::registry::MethodRegistry;
use crate::run_context::{FiberEvent, FiberPool, RunContext};
use crate::signal::{Epoll, EventFd};
use crate::task::{Task, RC_CANCELLED, RC_UNKNOWN_METHOD, RC_UNKNOWN_POOL};
use crate::task_queue::TaskQueue;
use crate::timer::{StopWatch, Timepoint, VirtualClock};
use crate::types::{LaneId, WorkerId};

/// Block hints below this are served by spinning one more loop pass instead
/// of entering `epoll_wait`.
const SPIN_HINT_US: u64 = 50;

/// Upper bound on the idle `epoll_wait` timeout, so stop flags and foreign
/// wake-ups are observed promptly even if an edge is lost.
const MAX_IDLE_MS: i32 = 50;

/// Invocations running longer than this are logged at debug level.
const SLOW_TASK_US: u64 = 10_000;

/// A task admitted to the run-queue: fresh from a lane, or a parked
/// invocation whose resume condition was met.
enum ReadyItem {
    New(FullPtr<Task>),
    Resumed(Arc<RunContext>),
}

impl ReadyItem {
    fn est_cpu_time(&self) -> u64 {
        let task = match self {
            ReadyItem::New(task) => *task,
            ReadyItem::Resumed(ctx) => ctx.task(),
        };
        // SAFETY: admitted tasks are live until reaped by their waiter,
        // which cannot happen before completion.
        unsafe { task.get() }.est_cpu_time()
    }
}

/// A parked invocation.
struct BlockedEntry {
    ctx: Arc<RunContext>,
    since: Timepoint,
}

impl BlockedEntry {
    /// Whether the invocation may be resumed.
    fn resume_condition_met(&self, now: Timepoint) -> bool {
        // SAFETY: blocked tasks are live until completion.
        let task_ptr = self.ctx.task();
        let task = unsafe { task_ptr.get() };
        if task.is_cancel_requested() {
            return true;
        }
        if self.ctx.has_subtasks() {
            return self.ctx.subtasks_complete();
        }
        now.since(self.since) >= self.ctx.block_time_us()
    }
}

/// Configuration handed to each worker by the orchestrator.
pub(crate) struct WorkerSpec {
    pub id: WorkerId,
    pub lanes: Vec<LaneId>,
    pub queue: TaskQueue,
    pub alloc: MpAllocator,
    pub pools: PoolManager,
    pub registry: Arc<MethodRegistry>,
    pub stacks: usize,
    pub stop: Arc<AtomicBool>,
    pub grace: Duration,
}

/// A worker thread's state while running.
pub(crate) struct Worker {
    spec: WorkerSpec,
    fibers: FiberPool,
    epoll: Epoll,
    wake_fds: Vec<EventFd>,
    ready: Vec<ReadyItem>,
    blocked: Vec<BlockedEntry>,
    /// Ready tasks deferred because every carrier was busy.
    deferred: Vec<ReadyItem>,
    /// Coarse clock refreshed once per loop pass.
    clock: VirtualClock,
    /// Microseconds spent inside task invocations.
    busy_us: u64,
}

impl Worker {
    pub fn new(spec: WorkerSpec) -> Self {
        let fibers = FiberPool::new(spec.id, spec.stacks);
        let epoll = Epoll::new().expect("failed to create worker epoll");

        // Each owned lane gets its eventfd, created here because the worker
        // owns the lane's wake-up.
        let mut wake_fds = Vec::with_capacity(spec.lanes.len());
        for (i, lane) in spec.lanes.iter().enumerate() {
            let efd = EventFd::new().expect("failed to create lane eventfd");
            spec.queue.bind_lane(*lane, spec.id, efd.raw());
            epoll
                .add(efd.raw(), i as u64)
                .expect("failed to register lane eventfd");
            wake_fds.push(efd);
        }

        Self {
            spec,
            fibers,
            epoll,
            wake_fds,
            ready: Vec::new(),
            blocked: Vec::new(),
            deferred: Vec::new(),
            clock: VirtualClock::new(),
            busy_us: 0,
        }
    }

    /// The worker loop. Returns when stopped and drained.
    pub fn run(mut self) {
        log::debug(&format!(
            "{} started with {} lanes",
            self.spec.id,
            self.spec.lanes.len()
        ));
        let mut stop_deadline: Option<Instant> = None;

        loop {
            self.clock.refresh();
            let stopping = self.spec.stop.load(Ordering::Acquire);
            if stopping && stop_deadline.is_none() {
                stop_deadline = Some(Instant::now() + self.spec.grace);
            }
            let past_deadline =
                stop_deadline.map(|d| Instant::now() >= d).unwrap_or(false);

            self.drain_lanes(past_deadline);

            // Carried-over tasks that could not get a carrier last pass.
            self.ready.append(&mut self.deferred);
            self.ready.sort_by_key(ReadyItem::est_cpu_time);

            let mut did_work = false;
            let items: Vec<ReadyItem> = self.ready.drain(..).collect();
            for item in items {
                match item {
                    ReadyItem::New(task) => {
                        if self.start_task(task) {
                            did_work = true;
                        }
                    }
                    ReadyItem::Resumed(ctx) => {
                        if self.resume_task(ctx) {
                            did_work = true;
                        }
                    }
                }
            }

            self.readmit_blocked(past_deadline);

            if stopping
                && self.ready.is_empty()
                && self.deferred.is_empty()
                && self.blocked.is_empty()
                && self.lanes_empty()
            {
                break;
            }

            if !did_work && self.ready.is_empty() && self.deferred.is_empty() {
                self.idle_wait();
            }
        }

        self.fibers.shutdown();
        log::debug(&format!(
            "{} stopped after {} us of task time",
            self.spec.id, self.busy_us
        ));
    }

    /// Pull everything queued on the owned lanes into the ready queue,
    /// highest priority first.
    fn drain_lanes(&mut self, past_deadline: bool) {
        let prios = self.spec.queue.num_prios();
        for i in 0..self.spec.lanes.len() {
            let lane = self.spec.lanes[i];
            for prio in (0..prios as u32).rev() {
                while let Some(entry) = self.spec.queue.dequeue(lane, prio) {
                    let task = self.resolve_entry(entry.task);
                    if task.is_null() {
                        continue;
                    }
                    if past_deadline {
                        // The grace period is over: fail fast instead of
                        // starting work that will not finish.
                        // SAFETY: queued tasks are live until reaped.
                        unsafe { task.get() }.signal_complete(RC_CANCELLED);
                        continue;
                    }
                    self.ready.push(ReadyItem::New(task));
                }
            }
        }
    }

    fn resolve_entry(&self, ptr: silt_shm::ShmPtr) -> FullPtr<Task> {
        if ptr.is_null() {
            return FullPtr::null();
        }
        FullPtr::new(self.spec.alloc.resolve_t::<Task>(ptr.off), ptr)
    }

    /// Run a fresh task to completion or first yield.
    /// Returns whether the pass made progress.
    fn start_task(&mut self, task: FullPtr<Task>) -> bool {
        // SAFETY: admitted tasks are live until reaped.
        let record = unsafe { task.get() };

        let kind = match self.spec.pools.kind_of(record.pool_id) {
            Ok(kind) => kind,
            Err(_) => {
                record.signal_complete(RC_UNKNOWN_POOL);
                return true;
            }
        };
        let func = match self.spec.registry.resolve(kind, record.method) {
            Ok(func) => func,
            Err(_) => {
                record.signal_complete(RC_UNKNOWN_METHOD);
                return true;
            }
        };

        let Some(carrier) = self.fibers.acquire() else {
            // Every carrier is parked on a blocked task; try again next pass.
            self.deferred.push(ReadyItem::New(task));
            return false;
        };

        let ctx = self.fibers.make_context(task, carrier);
        let watch = StopWatch::start();
        let event = self.fibers.start(ctx.clone(), func);
        self.observe_invocation(&ctx, watch.elapsed_us());
        match event {
            FiberEvent::Completed => {
                self.fibers.release(carrier);
                true
            }
            FiberEvent::Yielded => {
                self.blocked.push(BlockedEntry {
                    ctx,
                    since: self.clock.now(),
                });
                false
            }
        }
    }

    /// Resume a parked invocation.
    /// Returns whether the pass made progress.
    fn resume_task(&mut self, ctx: Arc<RunContext>) -> bool {
        let carrier = ctx.carrier();
        let watch = StopWatch::start();
        let event = self.fibers.resume(&ctx);
        self.observe_invocation(&ctx, watch.elapsed_us());
        match event {
            FiberEvent::Completed => {
                self.fibers.release(carrier);
                true
            }
            FiberEvent::Yielded => {
                self.blocked.push(BlockedEntry {
                    ctx,
                    since: self.clock.now(),
                });
                false
            }
        }
    }

    /// Account one carrier handoff and flag tasks that hog their worker.
    fn observe_invocation(&mut self, ctx: &Arc<RunContext>, elapsed_us: u64) {
        self.busy_us += elapsed_us;
        if elapsed_us >= SLOW_TASK_US {
            // SAFETY: the task is live until reaped.
            let task_ptr = ctx.task();
            let task = unsafe { task_ptr.get() };
            log::debug(&format!(
                "{}: task {} held the worker for {} us between yields",
                self.spec.id, task.task_id, elapsed_us
            ));
        }
    }

    /// Move blocked invocations whose condition is met back to ready.
    fn readmit_blocked(&mut self, past_deadline: bool) {
        let now = self.clock.now();
        let mut still_blocked = Vec::with_capacity(self.blocked.len());
        for entry in self.blocked.drain(..) {
            if past_deadline {
                // SAFETY: blocked tasks are live until completion.
                unsafe { entry.ctx.task().get() }.request_cancel();
            }
            if past_deadline || entry.resume_condition_met(now) {
                self.ready.push(ReadyItem::Resumed(entry.ctx));
            } else {
                still_blocked.push(entry);
            }
        }
        self.blocked = still_blocked;
    }

    fn lanes_empty(&self) -> bool {
        self.spec
            .lanes
            .iter()
            .all(|lane| self.spec.queue.lane_header(*lane).pending() == 0)
    }

    /// Sleep until a lane signals, bounded by the blocked tasks' hints.
    fn idle_wait(&mut self) {
        // A sub-threshold hint prefers one more spin over the syscall.
        let min_hint = self
            .blocked
            .iter()
            .map(|e| e.ctx.block_time_us())
            .min();
        if matches!(min_hint, Some(hint) if hint < SPIN_HINT_US) {
            std::thread::yield_now();
            return;
        }

        let timeout_ms = match min_hint {
            Some(hint) => ((hint / 1000).max(1) as i32).min(MAX_IDLE_MS),
            None => MAX_IDLE_MS,
        };

        for lane in &self.spec.lanes {
            self.spec.queue.lane_header(*lane).set_active(false);
        }
        let ready = self.epoll.wait(timeout_ms, self.wake_fds.len().max(1));
        for token in ready {
            if let Some(efd) = self.wake_fds.get(token as usize) {
                efd.drain();
            }
        }
        for lane in &self.spec.lanes {
            self.spec.queue.lane_header(*lane).set_active(true);
        }
    }
}

