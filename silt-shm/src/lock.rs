//! # Shared-Memory Spin Lock
//!
//! A lock that can live inside a shared mapping: a single `AtomicU32` word
//! with no process-local state. Process-local code should prefer the standard
//! synchronization primitives; this lock exists for structures that must be
//! coherent across process boundaries (allocator free lists, lane headers).
//!
//! Acquisition is scoped: [`SpinLock::lock`] returns a guard that releases on
//! every exit path. Holding a spin guard across a task yield is a scheduler
//! invariant violation, enforced by the runtime crate.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Word-sized spin lock for shared memory.
#[repr(transparent)]
#[derive(Debug)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Initialize in place (for records constructed inside shared memory).
    pub fn init(&mut self) {
        self.state = AtomicU32::new(UNLOCKED);
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinGuard<'_> {
        let mut spins: u32 = 0;
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: self };
            }
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                // Back off to the OS after a burst of failed attempts so a
                // descheduled holder in another process can make progress.
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; releases the lock on drop.
#[derive(Debug)]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new();
        assert!(!lock.is_locked());
        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new();
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::cell::UnsafeCell::new(0u64));

        struct SharedCounter(Arc<std::cell::UnsafeCell<u64>>);
        unsafe impl Send for SharedCounter {}

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = SharedCounter(counter.clone());
            handles.push(std::thread::spawn(move || {
                let counter = counter;
                for _ in 0..10_000 {
                    let _guard = lock.lock();
                    // SAFETY: the spin lock serializes access.
                    unsafe { *counter.0.get() += 1 };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *counter.get() }, 40_000);
    }
}
