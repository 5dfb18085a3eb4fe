//! End-to-end scheduler scenarios over an in-process runtime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use silt_runtime::{
    MethodId, PoolId, PoolKind, Runtime, RuntimeConfig, RuntimeError, RC_CANCELLED, RC_OK,
};

const TEST_POOL: PoolId = PoolId(100);
const TEST_KIND: PoolKind = PoolKind(50);

const METHOD_ECHO: MethodId = MethodId(1);
const METHOD_DOUBLE_CHILD: MethodId = MethodId(2);
const METHOD_CHILD: MethodId = MethodId(3);
const METHOD_TICKER: MethodId = MethodId(4);

fn test_runtime(workers: usize, lanes: usize) -> Arc<Runtime> {
    let config = RuntimeConfig::builder()
        .num_workers(workers)
        .num_lanes(lanes)
        .queue_depth(64)
        .stacks_per_worker(8)
        .shm_size(32 << 20)
        .grace_period_ms(2000)
        .build();
    Arc::new(Runtime::create_in_process(config).expect("runtime creation"))
}

#[test]
fn test_fifo_completion_single_lane() {
    let rt = test_runtime(1, 1);
    let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();
    let order2 = order.clone();
    rt.registry()
        .register_method(TEST_KIND, METHOD_ECHO, move |_ctx, task| {
            let i = task.args()[0];
            order2.lock().push(i);
            task.set_result(i as i32);
        });

    rt.start();

    // Ten tasks on one lane of one worker: each future's result equals the
    // task's index and completion order equals submission order.
    let futures: Vec<_> = (0..10u8)
        .map(|i| rt.enqueue(TEST_POOL, 0, 0, METHOD_ECHO, &[i]).unwrap())
        .collect();
    for (i, fut) in futures.iter().enumerate() {
        assert_eq!(fut.wait(100), i as i32);
    }
    assert_eq!(*order.lock(), (0..10).collect::<Vec<u8>>());

    for fut in futures {
        rt.reap(fut);
    }
    rt.stop();
}

#[test]
fn test_dependency_chain() {
    let rt = test_runtime(1, 1);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();

    rt.registry()
        .register_method(TEST_KIND, METHOD_CHILD, |_ctx, task| {
            task.set_result(7);
        });

    let rt_inner = rt.clone();
    rt.registry()
        .register_method(TEST_KIND, METHOD_DOUBLE_CHILD, move |_ctx, task| {
            // Spawn a child and wait on it; the worker parks this task until
            // the child's completion flag is published.
            let child = rt_inner
                .enqueue(TEST_POOL, 0, 0, METHOD_CHILD, &[])
                .expect("child submission");
            let child_result = child.wait(500);
            rt_inner.reap(child);
            task.set_result(child_result * 2);
        });

    rt.start();

    let fut = rt
        .enqueue(TEST_POOL, 0, 0, METHOD_DOUBLE_CHILD, &[])
        .unwrap();
    assert_eq!(fut.wait(500), 14);
    rt.reap(fut);
    rt.stop();
}

#[test]
fn test_enqueue_unknown_pool_fails() {
    let rt = test_runtime(1, 1);
    let err = rt.enqueue(PoolId(999), 0, 0, METHOD_ECHO, &[]).err();
    assert_eq!(err, Some(RuntimeError::UnknownPool(PoolId(999))));
    rt.stop();
}

#[test]
fn test_unknown_method_completes_with_error() {
    let rt = test_runtime(1, 1);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();
    rt.start();

    let fut = rt.enqueue(TEST_POOL, 0, 0, MethodId(777), &[]).unwrap();
    let rc = fut.wait(100);
    assert_eq!(rc, silt_runtime::RC_UNKNOWN_METHOD);
    rt.reap(fut);
    rt.stop();
}

#[test]
fn test_queue_overflow_surfaces_at_submit() {
    // Do not start workers: the lane fills up and stays full.
    let config = RuntimeConfig::builder()
        .num_workers(1)
        .num_lanes(1)
        .queue_depth(4)
        .shm_size(32 << 20)
        .build();
    let rt = Runtime::create_in_process(config).unwrap();
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();

    let mut futures = Vec::new();
    for _ in 0..4 {
        futures.push(rt.enqueue(TEST_POOL, 0, 0, METHOD_ECHO, &[0]).unwrap());
    }
    let err = rt.enqueue(TEST_POOL, 0, 0, METHOD_ECHO, &[0]).err();
    assert_eq!(err, Some(RuntimeError::QueueFull));
}

#[test]
fn test_cooperative_cancellation() {
    let rt = test_runtime(1, 1);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();
    rt.registry()
        .register_method(TEST_KIND, METHOD_TICKER, |ctx, _task| {
            // Yields every millisecond until cancelled.
            loop {
                ctx.yield_with(1000);
            }
        });

    rt.start();

    let fut = rt.enqueue(TEST_POOL, 0, 0, METHOD_TICKER, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    // SAFETY: the task is live until reaped.
    unsafe { fut.task().get() }.request_cancel();

    let rc = fut.wait(1000);
    assert_eq!(rc, RC_CANCELLED);
    rt.reap(fut);
    rt.stop();
}

#[test]
fn test_watchdog_cancels_after_deadline() {
    let rt = test_runtime(1, 2);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();
    rt.registry()
        .register_method(TEST_KIND, METHOD_TICKER, |ctx, _task| loop {
            ctx.yield_with(1000);
        });

    rt.start();

    let fut = rt.enqueue(TEST_POOL, 0, 0, METHOD_TICKER, &[]).unwrap();
    let dog = rt.spawn_watchdog(&fut, 20).unwrap();

    assert_eq!(fut.wait(1000), RC_CANCELLED);
    assert_eq!(dog.wait(1000), RC_OK);
    rt.reap(dog);
    rt.reap(fut);
    rt.stop();
}

#[test]
fn test_cancel_does_not_propagate_to_children() {
    let rt = test_runtime(1, 1);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();

    static CHILD_DONE: AtomicU32 = AtomicU32::new(0);
    rt.registry()
        .register_method(TEST_KIND, METHOD_CHILD, |ctx, task| {
            // Take a few scheduling turns before finishing.
            for _ in 0..3 {
                ctx.yield_with(100);
            }
            CHILD_DONE.store(1, Ordering::Release);
            task.set_result(RC_OK);
        });

    let rt_inner = rt.clone();
    rt.registry()
        .register_method(TEST_KIND, METHOD_TICKER, move |ctx, _task| {
            // Fire-and-forget child: the parent spins until cancelled, the
            // child keeps running on its own.
            let _child = rt_inner
                .enqueue(TEST_POOL, 0, 0, METHOD_CHILD, &[])
                .expect("child submission");
            loop {
                ctx.yield_with(500);
            }
        });

    rt.start();

    let parent = rt.enqueue(TEST_POOL, 0, 0, METHOD_TICKER, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(10));
    // SAFETY: the task is live until reaped.
    unsafe { parent.task().get() }.request_cancel();
    assert_eq!(parent.wait(1000), RC_CANCELLED);

    // The child was not cancelled with its parent.
    let deadline = Instant::now() + Duration::from_secs(2);
    while CHILD_DONE.load(Ordering::Acquire) == 0 {
        assert!(Instant::now() < deadline, "child never completed");
        std::thread::sleep(Duration::from_millis(1));
    }
    rt.reap(parent);
    rt.stop();
}

#[test]
fn test_worker_wakes_from_idle() {
    let rt = test_runtime(2, 4);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();
    rt.registry()
        .register_method(TEST_KIND, METHOD_ECHO, |_ctx, task| {
            task.set_result(task.args()[0] as i32);
        });

    rt.start();
    // Let every worker reach its idle wait.
    std::thread::sleep(Duration::from_millis(30));

    let started = Instant::now();
    let fut = rt.enqueue(TEST_POOL, 3, 0, METHOD_ECHO, &[42]).unwrap();
    assert_eq!(fut.wait(100), 42);
    // Wake-up plus dispatch stays well under the idle timeout bound.
    assert!(started.elapsed() < Duration::from_millis(500));
    rt.reap(fut);
    rt.stop();
}

#[test]
fn test_priorities_preempt_at_dequeue() {
    let rt = test_runtime(1, 1);
    let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();
    let order2 = order.clone();
    rt.registry()
        .register_method(TEST_KIND, METHOD_ECHO, move |_ctx, task| {
            order2.lock().push(task.args()[0]);
            task.set_result(RC_OK);
        });

    // Queue before starting so both priorities are populated when the
    // worker first drains its lanes.
    let low = rt.enqueue(TEST_POOL, 0, 0, METHOD_ECHO, &[1]).unwrap();
    let high = rt.enqueue(TEST_POOL, 0, 1, METHOD_ECHO, &[2]).unwrap();

    rt.start();
    low.wait(100);
    high.wait(100);

    // The higher priority level dequeues first.
    assert_eq!(*order.lock(), vec![2, 1]);
    rt.reap(low);
    rt.reap(high);
    rt.stop();
}

#[test]
fn test_many_tasks_across_workers() {
    let rt = test_runtime(3, 6);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();

    static COMPLETED: AtomicU32 = AtomicU32::new(0);
    rt.registry()
        .register_method(TEST_KIND, METHOD_ECHO, |_ctx, task| {
            COMPLETED.fetch_add(1, Ordering::AcqRel);
            task.set_result(task.args()[0] as i32);
        });

    rt.start();

    let futures: Vec<_> = (0..120u32)
        .map(|i| {
            rt.enqueue(TEST_POOL, i, 0, METHOD_ECHO, &[(i % 256) as u8])
                .unwrap()
        })
        .collect();
    for (i, fut) in futures.iter().enumerate() {
        assert_eq!(fut.wait(500), (i % 256) as i32);
    }
    assert_eq!(COMPLETED.load(Ordering::Acquire), 120);
    for fut in futures {
        rt.reap(fut);
    }
    rt.stop();
}

#[test]
fn test_comutex_across_tasks() {
    use silt_runtime::CoMutex;

    let rt = test_runtime(1, 2);
    rt.pools().register_pool(TEST_POOL, TEST_KIND, "test").unwrap();

    // A non-atomic counter protected by the cooperative mutex: contended
    // tasks yield back to the worker instead of stalling it.
    struct Shared {
        mutex: CoMutex,
        counter: std::cell::UnsafeCell<u64>,
    }
    unsafe impl Sync for Shared {}
    unsafe impl Send for Shared {}

    let shared = Arc::new(Shared {
        mutex: CoMutex::new(),
        counter: std::cell::UnsafeCell::new(0),
    });

    let shared2 = shared.clone();
    rt.registry()
        .register_method(TEST_KIND, METHOD_TICKER, move |ctx, task| {
            for _ in 0..50 {
                let _guard = shared2.mutex.lock();
                // SAFETY: the cooperative mutex serializes access.
                unsafe { *shared2.counter.get() += 1 };
                drop(_guard);
                ctx.yield_with(10);
            }
            task.set_result(RC_OK);
        });

    rt.start();

    let futures: Vec<_> = (0..4)
        .map(|i| rt.enqueue(TEST_POOL, i, 0, METHOD_TICKER, &[]).unwrap())
        .collect();
    for fut in &futures {
        assert_eq!(fut.wait(1000), RC_OK);
    }
    assert_eq!(unsafe { *shared.counter.get() }, 200);
    for fut in futures {
        rt.reap(fut);
    }
    rt.stop();
}

#[test]
fn test_stop_runtime_via_admin_task() {
    let rt = test_runtime(1, 2);
    rt.start();
    assert!(rt.is_running());

    let stop = rt.submit_stop().unwrap();
    assert_eq!(stop.wait(1000), RC_OK);

    // The workers observe the stop flag and drain out.
    let deadline = Instant::now() + Duration::from_secs(5);
    while rt.is_running() {
        assert!(Instant::now() < deadline, "runtime never stopped");
        std::thread::sleep(Duration::from_millis(5));
    }
    rt.stop();
}

#[test]
fn test_start_is_idempotent() {
    let rt = test_runtime(1, 1);
    assert!(rt.start());
    assert!(!rt.start());
    rt.stop();
}
