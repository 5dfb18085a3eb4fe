//! # Timers
//!
//! Microsecond bookkeeping for the scheduler: an integer timepoint that is
//! cheap to copy and compare, a stopwatch for measuring task invocations,
//! and a virtual clock workers advance once per loop pass so hot paths
//! compare integers instead of taking a clock syscall each time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A point in time measured in integer microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timepoint(pub u64);

impl Timepoint {
    /// The microsecond value.
    pub fn as_us(&self) -> u64 {
        self.0
    }

    /// This timepoint shifted forward.
    pub fn add_us(&self, us: u64) -> Timepoint {
        Timepoint(self.0 + us)
    }

    /// Microseconds elapsed since `earlier`; zero when `earlier` is later.
    pub fn since(&self, earlier: Timepoint) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::ops::Add<u64> for Timepoint {
    type Output = Timepoint;
    fn add(self, us: u64) -> Timepoint {
        Timepoint(self.0 + us)
    }
}

impl std::ops::Sub for Timepoint {
    type Output = u64;
    fn sub(self, other: Timepoint) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

/// A coarse clock advanced explicitly by its owner.
///
/// The worker refreshes it from the wall clock once per loop pass; blocked
/// set scans and hint comparisons then read a plain integer.
#[derive(Debug)]
pub struct VirtualClock {
    epoch: Instant,
    now_us: AtomicU64,
}

impl VirtualClock {
    /// Create a clock at microsecond zero.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            now_us: AtomicU64::new(0),
        }
    }

    /// Refresh from the wall clock and return the new timepoint.
    pub fn refresh(&self) -> Timepoint {
        let us = self.epoch.elapsed().as_micros() as u64;
        self.now_us.store(us, Ordering::Release);
        Timepoint(us)
    }

    /// The timepoint of the last refresh.
    pub fn now(&self) -> Timepoint {
        Timepoint(self.now_us.load(Ordering::Acquire))
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock stopwatch for measuring invocations.
#[derive(Debug)]
pub struct StopWatch {
    started: Instant,
}

impl StopWatch {
    /// Start measuring.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Microseconds since start.
    pub fn elapsed_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    /// Restart the measurement.
    pub fn reset(&mut self) {
        self.started = Instant::now();
    }
}
