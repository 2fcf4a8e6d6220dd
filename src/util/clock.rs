//! Clock and delay utilities.

use std::sync::Arc;
use std::time::Instant;

use crate::hw::{ClockSource, DelayPrimitive};

/// Number of back-to-back samples used to estimate clock-read overhead.
const CALIBRATION_SAMPLES: u64 = 10;

/// A monotonic nanosecond clock backed by [`Instant`].
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a new clock with its origin at the current time.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Estimate the fixed cost of one clock read, in nanoseconds.
///
/// Samples the clock in a tight sequence and returns the average inter-sample
/// delta. The playback loop subtracts this from its busy-wait deadlines so
/// the effective fire time lands closer to the intended schedule.
///
/// The first estimate taken after process start is skewed by warm-up of the
/// clock path (page faults, lazy vDSO setup) and should be discarded by the
/// caller.
pub fn clock_overhead(clock: &dyn ClockSource) -> u64 {
    let init = clock.now_ns();
    for _ in 1..CALIBRATION_SAMPLES {
        clock.now_ns();
    }
    let after = clock.now_ns();
    (after - init) / CALIBRATION_SAMPLES
}

/// A delay that spins on the clock without yielding.
///
/// Safe to use inside handler context: it never sleeps and never touches a
/// scheduler, it just burns the requested wall-clock time.
pub struct SpinDelay {
    clock: Arc<dyn ClockSource>,
}

impl SpinDelay {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self { clock }
    }
}

impl DelayPrimitive for SpinDelay {
    fn delay_ns(&self, ns: u64) {
        let deadline = self.clock.now_ns().saturating_add(ns);
        while self.clock.now_ns() < deadline {
            std::hint::spin_loop();
        }
    }
}
