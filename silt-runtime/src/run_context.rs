//! # Run Contexts and Fiber Carriers
//!
//! A run context captures where one task invocation suspends and resumes:
//! the yield and resume endpoints, the blocked flag and block-time hint, and
//! the waiting-for set of subtasks the invocation depends on. Its lifetime
//! is exactly one invocation.
//!
//! Fibers are carrier threads pooled per worker. A carrier runs one task
//! invocation at a time; control alternates strictly between the worker and
//! the carrier through zero-capacity rendezvous channels, so within a worker
//! nothing ever runs concurrently — the cooperative contract of the
//! scheduler. Yield parks the carrier mid-stack (the "fiber stack") and
//! hands control back to the worker; resume does the reverse.
//!
//! Cancellation rides on the same mechanism: the first yield after the
//! cancel flag is set unwinds the carrier back to its boundary, where the
//! task is completed with the cancelled result code.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use silt_shm::{log, FullPtr};

use crate::registry::MethodFn;
use crate::task::{Task, TaskState, RC_CANCELLED, RC_TASK_PANIC};
use crate::types::WorkerId;

/// Unwind payload used to abandon a cancelled task at its next yield.
pub struct CancelUnwind;

/// What a carrier reports back to its worker after each handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberEvent {
    /// The task suspended; it is parked on its carrier.
    Yielded,
    /// The task invocation finished (completed, cancelled, or panicked).
    Completed,
}

/// Per-invocation scheduling state shared between a worker and one carrier.
pub struct RunContext {
    task: FullPtr<Task>,
    worker: WorkerId,
    carrier: usize,
    blocked: AtomicBool,
    block_time_us: AtomicU64,
    /// Subtasks this invocation is currently waiting on.
    waiting_for: Mutex<Vec<FullPtr<Task>>>,
    /// Carrier → worker events.
    event_tx: Sender<FiberEvent>,
    /// Worker → carrier resume signals.
    resume_rx: Receiver<()>,
}

impl RunContext {
    fn new(
        task: FullPtr<Task>,
        worker: WorkerId,
        carrier: usize,
        event_tx: Sender<FiberEvent>,
        resume_rx: Receiver<()>,
    ) -> Self {
        Self {
            task,
            worker,
            carrier,
            blocked: AtomicBool::new(false),
            block_time_us: AtomicU64::new(0),
            waiting_for: Mutex::new(Vec::new()),
            event_tx,
            resume_rx,
        }
    }

    /// The task this invocation belongs to.
    pub fn task(&self) -> FullPtr<Task> {
        self.task
    }

    /// The worker that owns this invocation.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Index of the carrier the invocation runs on.
    pub(crate) fn carrier(&self) -> usize {
        self.carrier
    }

    /// Whether the invocation is parked.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// The block-time hint recorded at the last suspension, in microseconds.
    pub fn block_time_us(&self) -> u64 {
        self.block_time_us.load(Ordering::Acquire)
    }

    /// Whether every subtask in the waiting-for set has completed.
    /// Vacuously true when the set is empty.
    pub fn subtasks_complete(&self) -> bool {
        self.waiting_for
            .lock()
            .iter()
            // SAFETY: entries are live task records; the waiter reaps them
            // only after this invocation completes.
            .all(|t| unsafe { t.get().is_complete() })
    }

    /// Whether the invocation is waiting on any subtasks.
    pub fn has_subtasks(&self) -> bool {
        !self.waiting_for.lock().is_empty()
    }

    /// Cooperatively suspend for roughly `block_time_us` microseconds.
    ///
    /// Must be called from the carrier executing this invocation. Yielding
    /// while already blocked is a scheduler invariant violation.
    pub fn yield_with(&self, block_time_us: u64) {
        if self.blocked.swap(true, Ordering::AcqRel) {
            // SAFETY: the task pointer is live for the invocation.
            let task = unsafe { self.task.get() };
            log::fatal(&format!(
                "{}: task {} yielded while already blocked (pool {}, method {})",
                self.worker, task.task_id, task.pool_id, task.method.0
            ));
        }
        self.block_time_us.store(block_time_us, Ordering::Release);
        // SAFETY: the task pointer is live for the invocation.
        let task = unsafe { self.task.get() };
        task.set_state(TaskState::Blocked);

        // Hand control to the worker and sleep until resumed. A dropped
        // channel means the worker is gone; unwind to the carrier boundary.
        if self.event_tx.send(FiberEvent::Yielded).is_err() {
            std::panic::panic_any(CancelUnwind);
        }
        if self.resume_rx.recv().is_err() {
            std::panic::panic_any(CancelUnwind);
        }

        self.blocked.store(false, Ordering::Release);
        task.set_state(TaskState::Running);
        if task.is_cancel_requested() {
            std::panic::panic_any(CancelUnwind);
        }
    }

    /// Wait until `flag` (typically a subtask's completion flag) becomes
    /// non-zero, yielding between polls. The waited-on task is recorded in
    /// the waiting-for set so the worker resumes this invocation when its
    /// dependencies complete.
    pub fn wait_task(&self, sub: &Task, flag: &AtomicU32, block_time_us: u64) {
        if flag.load(Ordering::Acquire) != 0 {
            // Already complete: never touches the blocked set.
            return;
        }
        let sub_ptr = FullPtr::new(sub as *const Task as *mut Task, sub.self_ptr());
        self.waiting_for.lock().push(sub_ptr);
        while flag.load(Ordering::Acquire) == 0 {
            self.yield_with(block_time_us);
        }
        let raw = sub as *const Task as *mut Task;
        self.waiting_for.lock().retain(|t| t.ptr != raw);
    }
}

thread_local! {
    /// The run context executing on this carrier thread, if any.
    static CURRENT: RefCell<Option<Arc<RunContext>>> = const { RefCell::new(None) };
}

/// The run context of the task executing on the current thread.
pub fn current_run_context() -> Option<Arc<RunContext>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Suspend the current task, or OS-yield when not on a worker fiber.
pub(crate) fn yield_current(block_time_us: u64) {
    match current_run_context() {
        Some(ctx) => ctx.yield_with(block_time_us),
        None => std::thread::yield_now(),
    }
}

/// Wait for `flag` on behalf of the current task, or spin with OS yields
/// when not on a worker fiber.
pub(crate) fn wait_current(sub: &Task, flag: &AtomicU32, block_time_us: u64) {
    match current_run_context() {
        Some(ctx) => ctx.wait_task(sub, flag, block_time_us),
        None => {
            while flag.load(Ordering::Acquire) == 0 {
                std::thread::yield_now();
            }
        }
    }
}

/// One task invocation handed to a carrier.
struct Job {
    ctx: Arc<RunContext>,
    func: MethodFn,
}

/// A pooled carrier thread.
struct FiberCarrier {
    job_tx: Option<Sender<Job>>,
    resume_tx: Sender<()>,
    event_rx: Receiver<FiberEvent>,
    /// Endpoints cloned into each run context dispatched to this carrier.
    event_tx: Sender<FiberEvent>,
    resume_rx: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl FiberCarrier {
    fn spawn(worker: WorkerId, index: usize) -> Self {
        let (job_tx, job_rx) = bounded::<Job>(0);
        let (resume_tx, resume_rx) = bounded::<()>(0);
        let (event_tx, event_rx) = bounded::<FiberEvent>(0);

        let carrier_event_tx = event_tx.clone();
        let thread = std::thread::Builder::new()
            .name(format!("silt-fiber-{}-{}", worker.0, index))
            .spawn(move || carrier_loop(job_rx, carrier_event_tx))
            .expect("failed to spawn fiber carrier thread");

        Self {
            job_tx: Some(job_tx),
            resume_tx,
            event_rx,
            event_tx,
            resume_rx,
            thread: Some(thread),
        }
    }
}

/// Body of a carrier thread: run one invocation per job, reporting the
/// outcome through the event channel.
fn carrier_loop(job_rx: Receiver<Job>, event_tx: Sender<FiberEvent>) {
    while let Ok(job) = job_rx.recv() {
        let ctx = job.ctx;
        // SAFETY: the worker guarantees the task outlives the invocation.
        let task_ptr = ctx.task();
        let task = unsafe { task_ptr.get_mut() };
        task.set_state(TaskState::Running);

        CURRENT.with(|cell| *cell.borrow_mut() = Some(ctx.clone()));
        let outcome = catch_unwind(AssertUnwindSafe(|| (job.func)(&ctx, &mut *task)));
        CURRENT.with(|cell| *cell.borrow_mut() = None);

        match outcome {
            Ok(()) => {
                if task.is_cancel_requested() {
                    // Cancelled after its last suspension point; the result
                    // still reports cancellation.
                    task.signal_complete(RC_CANCELLED);
                } else {
                    task.signal_complete(task.result_code());
                }
            }
            Err(payload) => {
                if payload.downcast_ref::<CancelUnwind>().is_some() {
                    task.signal_complete(RC_CANCELLED);
                } else {
                    log::error(&format!(
                        "task {} method panicked; completing with error",
                        task.task_id
                    ));
                    task.signal_complete(RC_TASK_PANIC);
                }
            }
        }

        if event_tx.send(FiberEvent::Completed).is_err() {
            return;
        }
    }
}

/// Per-worker pool of fiber carriers.
///
/// The pool size bounds how many task invocations of one worker can be
/// in flight (running or blocked) at once; tasks beyond that wait in the
/// ready queue until a carrier frees up.
pub(crate) struct FiberPool {
    worker: WorkerId,
    carriers: Vec<FiberCarrier>,
    free: Vec<usize>,
}

/// Keep cancellation unwinds out of the panic output; they are the normal
/// exit path of a cancelled task, not a failure.
fn install_cancel_panic_hook() {
    static HOOK: std::sync::Once = std::sync::Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<CancelUnwind>().is_none() {
                previous(info);
            }
        }));
    });
}

impl FiberPool {
    /// Spawn `count` carriers for `worker`.
    pub fn new(worker: WorkerId, count: usize) -> Self {
        install_cancel_panic_hook();
        let carriers = (0..count).map(|i| FiberCarrier::spawn(worker, i)).collect();
        Self {
            worker,
            carriers,
            free: (0..count).rev().collect(),
        }
    }

    /// Take a free carrier, if any.
    pub fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Return a carrier to the pool after its invocation completed.
    pub fn release(&mut self, index: usize) {
        debug_assert!(!self.free.contains(&index));
        self.free.push(index);
    }

    /// Number of free carriers.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Build the run context for a fresh invocation on carrier `index`.
    pub fn make_context(&self, task: FullPtr<Task>, index: usize) -> Arc<RunContext> {
        let carrier = &self.carriers[index];
        Arc::new(RunContext::new(
            task,
            self.worker,
            index,
            carrier.event_tx.clone(),
            carrier.resume_rx.clone(),
        ))
    }

    /// Start an invocation and run it to its first yield or completion.
    pub fn start(&self, ctx: Arc<RunContext>, func: MethodFn) -> FiberEvent {
        let index = ctx.carrier();
        let carrier = &self.carriers[index];
        let job = Job { ctx, func };
        if let Some(job_tx) = &carrier.job_tx {
            if job_tx.send(job).is_err() {
                return FiberEvent::Completed;
            }
        } else {
            return FiberEvent::Completed;
        }
        carrier.event_rx.recv().unwrap_or(FiberEvent::Completed)
    }

    /// Resume a parked invocation and run it to its next yield or completion.
    ///
    /// Resuming a completed task, or an invocation attached to a different
    /// worker, is a scheduler invariant violation.
    pub fn resume(&self, ctx: &Arc<RunContext>) -> FiberEvent {
        if ctx.worker() != self.worker {
            log::fatal(&format!(
                "{}: resumed a run context attached to {}",
                self.worker,
                ctx.worker()
            ));
        }
        // SAFETY: the task pointer is live for the invocation.
        if unsafe { ctx.task().get() }.is_complete() {
            log::fatal(&format!(
                "{}: resumed a completed task {}",
                self.worker,
                unsafe { ctx.task().get() }.task_id
            ));
        }
        let carrier = &self.carriers[ctx.carrier()];
        if carrier.resume_tx.send(()).is_err() {
            return FiberEvent::Completed;
        }
        carrier.event_rx.recv().unwrap_or(FiberEvent::Completed)
    }

    /// Tear the pool down: close the job channels and join the carriers.
    pub fn shutdown(&mut self) {
        for carrier in &mut self.carriers {
            carrier.job_tx = None;
        }
        for carrier in &mut self.carriers {
            if let Some(thread) = carrier.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RC_OK;
    use crate::types::{next_task_id, MethodId, PoolId};
    use silt_shm::ShmPtr;

    fn make_task() -> Box<Task> {
        let mut boxed: Box<std::mem::MaybeUninit<Task>> = Box::new(std::mem::MaybeUninit::uninit());
        // SAFETY: init_at fully initializes the record.
        unsafe {
            Task::init_at(
                boxed.as_mut_ptr(),
                ShmPtr::null(),
                next_task_id(),
                PoolId(2),
                MethodId(1),
                0,
                0,
                &[],
            );
            std::mem::transmute::<Box<std::mem::MaybeUninit<Task>>, Box<Task>>(boxed)
        }
    }

    fn full(task: &Task) -> FullPtr<Task> {
        FullPtr::new(task as *const Task as *mut Task, ShmPtr::null())
    }

    #[test]
    fn test_run_to_completion() {
        let task = make_task();
        let mut pool = FiberPool::new(WorkerId(0), 2);
        let index = pool.acquire().unwrap();
        let ctx = pool.make_context(full(&task), index);

        let event = pool.start(
            ctx,
            Arc::new(|_ctx: &RunContext, task: &mut Task| {
                task.set_result(11);
            }),
        );
        assert_eq!(event, FiberEvent::Completed);
        assert!(task.is_complete());
        assert_eq!(task.result_code(), 11);
        pool.release(index);
        assert_eq!(pool.available(), 2);
        pool.shutdown();
    }

    #[test]
    fn test_yield_and_resume() {
        let task = make_task();
        let mut pool = FiberPool::new(WorkerId(0), 1);
        let index = pool.acquire().unwrap();
        let ctx = pool.make_context(full(&task), index);

        let event = pool.start(
            ctx.clone(),
            Arc::new(|ctx: &RunContext, task: &mut Task| {
                ctx.yield_with(100);
                task.set_result(5);
            }),
        );
        assert_eq!(event, FiberEvent::Yielded);
        assert!(ctx.is_blocked());
        assert_eq!(ctx.block_time_us(), 100);
        assert!(!task.is_complete());

        let event = pool.resume(&ctx);
        assert_eq!(event, FiberEvent::Completed);
        assert!(task.is_complete());
        assert_eq!(task.result_code(), 5);
        pool.shutdown();
    }

    #[test]
    fn test_multiple_yields() {
        let task = make_task();
        let mut pool = FiberPool::new(WorkerId(0), 1);
        let index = pool.acquire().unwrap();
        let ctx = pool.make_context(full(&task), index);

        let event = pool.start(
            ctx.clone(),
            Arc::new(|ctx: &RunContext, task: &mut Task| {
                for _ in 0..3 {
                    ctx.yield_with(0);
                }
                task.set_result(RC_OK);
            }),
        );
        assert_eq!(event, FiberEvent::Yielded);
        assert_eq!(pool.resume(&ctx), FiberEvent::Yielded);
        assert_eq!(pool.resume(&ctx), FiberEvent::Yielded);
        assert_eq!(pool.resume(&ctx), FiberEvent::Completed);
        assert!(task.is_complete());
        pool.shutdown();
    }

    #[test]
    fn test_cancel_at_next_yield() {
        let task = make_task();
        let mut pool = FiberPool::new(WorkerId(0), 1);
        let index = pool.acquire().unwrap();
        let ctx = pool.make_context(full(&task), index);

        let event = pool.start(
            ctx.clone(),
            Arc::new(|ctx: &RunContext, _task: &mut Task| {
                // Yields forever; only cancellation ends it.
                loop {
                    ctx.yield_with(1000);
                }
            }),
        );
        assert_eq!(event, FiberEvent::Yielded);

        // SAFETY: the task is live.
        unsafe { ctx.task().get() }.request_cancel();
        let event = pool.resume(&ctx);
        assert_eq!(event, FiberEvent::Completed);
        assert!(task.is_complete());
        assert_eq!(task.result_code(), RC_CANCELLED);
        pool.shutdown();
    }

    #[test]
    fn test_panic_completes_with_error() {
        let task = make_task();
        let mut pool = FiberPool::new(WorkerId(0), 1);
        let index = pool.acquire().unwrap();
        let ctx = pool.make_context(full(&task), index);

        let event = pool.start(
            ctx,
            Arc::new(|_ctx: &RunContext, _task: &mut Task| {
                panic!("method exploded");
            }),
        );
        assert_eq!(event, FiberEvent::Completed);
        assert!(task.is_complete());
        assert_eq!(task.result_code(), RC_TASK_PANIC);
        pool.shutdown();
    }

    #[test]
    fn test_wait_task_records_dependency() {
        let parent = make_task();
        let child = make_task();
        let mut pool = FiberPool::new(WorkerId(0), 1);
        let index = pool.acquire().unwrap();
        let ctx = pool.make_context(full(&parent), index);

        let child_ptr = full(&child);
        let event = pool.start(
            ctx.clone(),
            Arc::new(move |_ctx: &RunContext, task: &mut Task| {
                // SAFETY: the child outlives the invocation in this test.
                let child = unsafe { child_ptr.get() };
                child.wait(child.completion_flag(), 50);
                task.set_result(child.result_code() * 2);
            }),
        );
        assert_eq!(event, FiberEvent::Yielded);
        assert!(ctx.has_subtasks());
        assert!(!ctx.subtasks_complete());

        child.signal_complete(7);
        assert!(ctx.subtasks_complete());

        let event = pool.resume(&ctx);
        assert_eq!(event, FiberEvent::Completed);
        assert_eq!(parent.result_code(), 14);
        assert!(!ctx.has_subtasks());
        pool.shutdown();
    }

    #[test]
    fn test_wait_on_complete_flag_returns_immediately() {
        let parent = make_task();
        let child = make_task();
        child.signal_complete(3);

        let mut pool = FiberPool::new(WorkerId(0), 1);
        let index = pool.acquire().unwrap();
        let ctx = pool.make_context(full(&parent), index);

        let child_ptr = full(&child);
        let event = pool.start(
            ctx,
            Arc::new(move |_ctx: &RunContext, task: &mut Task| {
                // SAFETY: the child outlives the invocation in this test.
                let child = unsafe { child_ptr.get() };
                // Waiting on an already-complete task never suspends.
                child.wait(child.completion_flag(), 50);
                task.set_result(child.result_code());
            }),
        );
        assert_eq!(event, FiberEvent::Completed);
        assert_eq!(parent.result_code(), 3);
        pool.shutdown();
    }
}
