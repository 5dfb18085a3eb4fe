//! # Wake-Up Plumbing and Process Signals
//!
//! Two concerns live here:
//!
//! - The lane wake-up protocol: each lane owns an eventfd created by the
//!   worker that owns the lane. Producers write a single byte when a lane
//!   transitions from empty to non-empty; the worker blocks in `epoll_wait`
//!   over all its lanes' descriptors in its idle branch.
//! - Process-level signal handling (SIGTERM/SIGINT) used by the runtime
//!   entry points for graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::libc;

use silt_shm::{ShmError, ShmResult};

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// An eventfd used to wake a sleeping worker.
#[derive(Debug)]
pub struct EventFd {
    fd: i32,
}

impl EventFd {
    /// Create a non-blocking eventfd.
    pub fn new() -> ShmResult<Self> {
        // SAFETY: eventfd with valid flags.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(ShmError::BackingStoreError(last_errno()));
        }
        Ok(Self { fd })
    }

    /// The raw descriptor, storable in a lane header.
    pub fn raw(&self) -> i32 {
        self.fd
    }

    /// Signal the descriptor. Usable with any raw fd value, so producers
    /// can signal a lane from the fd recorded in its header.
    pub fn signal_raw(fd: i32) {
        if fd < 0 {
            return;
        }
        let value: u64 = 1;
        // A failed write only costs a delayed wake-up; the worker's epoll
        // timeout bounds the damage.
        // SAFETY: writes 8 bytes from a valid buffer.
        unsafe {
            libc::write(
                fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Signal this descriptor.
    pub fn signal(&self) {
        Self::signal_raw(self.fd);
    }

    /// Drain the counter so the next signal is a fresh edge.
    pub fn drain(&self) {
        let mut value: u64 = 0;
        // SAFETY: reads 8 bytes into a valid buffer; EAGAIN when unsignaled.
        unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // SAFETY: fd was returned by eventfd.
        unsafe { libc::close(self.fd) };
    }
}

/// An epoll instance a worker sleeps on.
#[derive(Debug)]
pub struct Epoll {
    epfd: i32,
}

impl Epoll {
    /// Create an epoll instance.
    pub fn new() -> ShmResult<Self> {
        // SAFETY: epoll_create1 with valid flags.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(ShmError::BackingStoreError(last_errno()));
        }
        Ok(Self { epfd })
    }

    /// Register `fd` for readability, tagged with `token`.
    pub fn add(&self, fd: i32, token: u64) -> ShmResult<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: epfd and fd are valid descriptors.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            return Err(ShmError::BackingStoreError(last_errno()));
        }
        Ok(())
    }

    /// Remove `fd` from the set.
    pub fn remove(&self, fd: i32) {
        // SAFETY: epfd is valid; removing an unknown fd is harmless here.
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Block until a registered descriptor is readable or the timeout
    /// elapses. Returns the tokens of ready descriptors.
    pub fn wait(&self, timeout_ms: i32, max_events: usize) -> Vec<u64> {
        let mut events: Vec<libc::epoll_event> =
            vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)];
        // SAFETY: events points at max_events valid entries.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n <= 0 {
            return Vec::new();
        }
        events[..n as usize].iter().map(|e| e.u64).collect()
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // SAFETY: epfd was returned by epoll_create1.
        unsafe { libc::close(self.epfd) };
    }
}

// ============================================================================
// Process signals
// ============================================================================

/// Set when SIGTERM or SIGINT is received.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether a shutdown signal has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Request shutdown programmatically (used by tests and the stop path).
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Signal handlers only set atomic flags (async-signal-safe).
extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install SIGTERM/SIGINT handlers for graceful shutdown.
///
/// Returns false when installation fails.
pub fn install_handlers() -> bool {
    use nix::sys::signal::{self, SigHandler, Signal};
    // SAFETY: the handler only touches atomics.
    unsafe {
        if signal::signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).is_err() {
            return false;
        }
        if signal::signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_signal_and_drain() {
        let efd = EventFd::new().unwrap();
        assert!(efd.raw() >= 0);
        efd.signal();
        efd.drain();
    }

    #[test]
    fn test_epoll_wakes_on_signal() {
        let efd = EventFd::new().unwrap();
        let epoll = Epoll::new().unwrap();
        epoll.add(efd.raw(), 42).unwrap();

        // Nothing signaled: times out empty.
        assert!(epoll.wait(0, 8).is_empty());

        efd.signal();
        let ready = epoll.wait(100, 8);
        assert_eq!(ready, vec![42]);

        // Drain, then the next wait times out again.
        efd.drain();
        assert!(epoll.wait(0, 8).is_empty());
    }

    #[test]
    fn test_epoll_wakes_from_other_thread() {
        let efd = EventFd::new().unwrap();
        let epoll = Epoll::new().unwrap();
        epoll.add(efd.raw(), 7).unwrap();

        let fd = efd.raw();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            EventFd::signal_raw(fd);
        });

        let ready = epoll.wait(1000, 8);
        assert_eq!(ready, vec![7]);
        writer.join().unwrap();
    }

    #[test]
    fn test_shutdown_flag() {
        assert!(install_handlers());
        request_shutdown();
        assert!(shutdown_requested());
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    }
}
