//! Drop accounting.

use crate::util::stats::LatencyEstimates;

/// Number of scheduled interrupts whose handler invocation was never
/// observed.
///
/// Must be computed from a run-local arrival delta, not the raw counter,
/// since the counter persists across runs on the same engine. The result is
/// always within `[0, scheduled]`.
pub fn dropped(scheduled: usize, observed: u64) -> usize {
    scheduled.saturating_sub(observed as usize)
}

/// The outcome of one playback run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Entries the player issued.
    pub scheduled: usize,

    /// Handler invocations observed during the run.
    pub observed: u64,

    /// Scheduled interrupts never observed.
    pub dropped: usize,

    /// Calibration offset applied to the busy-wait deadlines.
    pub clock_overhead_ns: u64,

    /// Publications into a slot whose prior firing had not completed.
    pub slot_overruns: u64,

    /// Lateness of observed deliveries relative to their intended fire
    /// times.
    pub latency: LatencyEstimates,
}
