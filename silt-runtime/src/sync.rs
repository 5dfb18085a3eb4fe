//! # Cooperative Locks
//!
//! Locks for task methods: contention yields the running task back to its
//! worker instead of stalling the worker thread, so other tasks of the same
//! worker keep making progress. Off a worker fiber they degrade to OS-yield
//! spinning.
//!
//! These are distinct from the shared-memory spin lock: holding a spin lock
//! across a yield is an invariant violation, while these locks exist
//! precisely to be held across yields.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::run_context;

/// Block hint used while spinning on a contended lock, in microseconds.
const LOCK_YIELD_HINT_US: u64 = 10;

/// Cooperative mutual exclusion.
#[derive(Debug, Default)]
pub struct CoMutex {
    locked: AtomicU32,
}

impl CoMutex {
    /// Create an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            locked: AtomicU32::new(0),
        }
    }

    /// Acquire, yielding the current task while contended.
    pub fn lock(&self) -> CoMutexGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            run_context::yield_current(LOCK_YIELD_HINT_US);
        }
        CoMutexGuard { mutex: self }
    }

    /// Acquire without yielding; `None` when contended.
    pub fn try_lock(&self) -> Option<CoMutexGuard<'_>> {
        if self
            .locked
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(CoMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Whether the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != 0
    }
}

/// Guard for [`CoMutex`]; releases on drop.
#[derive(Debug)]
pub struct CoMutexGuard<'a> {
    mutex: &'a CoMutex,
}

impl Drop for CoMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.locked.store(0, Ordering::Release);
    }
}

/// Writer bit of the reader-writer state word.
const WRITER: u32 = 1 << 31;

/// Cooperative reader-writer lock.
#[derive(Debug, Default)]
pub struct CoRwLock {
    /// Reader count, with the writer bit on top.
    state: AtomicU32,
}

impl CoRwLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquire shared access, yielding while a writer holds the lock.
    pub fn read(&self) -> CoReadGuard<'_> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(
                        state,
                        state + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return CoReadGuard { lock: self };
            }
            run_context::yield_current(LOCK_YIELD_HINT_US);
        }
    }

    /// Acquire exclusive access, yielding while readers or a writer hold
    /// the lock.
    pub fn write(&self) -> CoWriteGuard<'_> {
        while self
            .state
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            run_context::yield_current(LOCK_YIELD_HINT_US);
        }
        CoWriteGuard { lock: self }
    }

    /// Current reader count.
    pub fn readers(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & !WRITER
    }

    /// Whether a writer holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

/// Shared guard for [`CoRwLock`]; releases on drop.
#[derive(Debug)]
pub struct CoReadGuard<'a> {
    lock: &'a CoRwLock,
}

impl Drop for CoReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive guard for [`CoRwLock`]; releases on drop.
#[derive(Debug)]
pub struct CoWriteGuard<'a> {
    lock: &'a CoRwLock,
}

impl Drop for CoWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_comutex_basic() {
        let mutex = CoMutex::new();
        assert!(!mutex.is_locked());
        {
            let _guard = mutex.lock();
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
        }
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_comutex_excludes_threads() {
        let mutex = Arc::new(CoMutex::new());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mutex = mutex.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = mutex.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_corwlock_readers_share() {
        let lock = CoRwLock::new();
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(lock.readers(), 2);
        assert!(!lock.is_write_locked());
        drop(r1);
        drop(r2);
        assert_eq!(lock.readers(), 0);
    }

    #[test]
    fn test_corwlock_writer_exclusive() {
        let lock = Arc::new(CoRwLock::new());
        let w = lock.write();
        assert!(lock.is_write_locked());

        let lock2 = lock.clone();
        let reader = std::thread::spawn(move || {
            let _r = lock2.read();
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        drop(w);
        reader.join().unwrap();
        assert_eq!(lock.readers(), 0);
    }
}
