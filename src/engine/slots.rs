//! Per-vector work slots.
//!
//! A slot is a single-writer/single-reader relay: the playback loop writes
//! the next firing's parameters strictly before sending the signal, and the
//! handler reads them strictly after delivery. The happens-before edge is the
//! signal itself; the atomics here make the publication explicit instead of
//! leaning on timing margins alone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::hw::{Vector, VECTOR_SPACE};

/// Parameters for the next firing of one vector.
pub struct WorkSlot {
    /// Simulated handler work, in nanoseconds.
    duration_ns: AtomicU64,

    /// Absolute intended fire time, for lateness measurement.
    deadline_ns: AtomicU64,

    /// Set by `publish`, cleared by `complete`. While set, the slot's prior
    /// firing has not finished and a new publication is an overrun.
    busy: AtomicBool,
}

impl WorkSlot {
    fn new() -> Self {
        Self {
            duration_ns: AtomicU64::new(0),
            deadline_ns: AtomicU64::new(0),
            busy: AtomicBool::new(false),
        }
    }

    /// Publish the parameters for the slot's next firing.
    ///
    /// Must be called before the corresponding signal is sent. Returns false
    /// if the slot was still busy with its prior firing; the write goes
    /// through regardless, so the caller can keep the schedule, but the prior
    /// handler invocation may now read parameters meant for this one. The
    /// playback loop surfaces that as a slot overrun rather than blocking,
    /// since timing fidelity is the deliverable.
    pub fn publish(&self, duration_ns: u64, deadline_ns: u64) -> bool {
        let was_busy = self.busy.swap(true, Ordering::AcqRel);
        self.deadline_ns.store(deadline_ns, Ordering::Relaxed);
        self.duration_ns.store(duration_ns, Ordering::Release);
        !was_busy
    }

    /// Read the published parameters. Called by the handler after delivery.
    ///
    /// # Returns
    ///
    /// The (duration, deadline) pair, both in nanoseconds.
    pub fn consume(&self) -> (u64, u64) {
        let duration_ns = self.duration_ns.load(Ordering::Acquire);
        let deadline_ns = self.deadline_ns.load(Ordering::Relaxed);
        (duration_ns, deadline_ns)
    }

    /// Mark the slot's in-flight firing as finished.
    pub fn complete(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// One slot per possible vector.
///
/// Sized to the full vector space rather than just the mapped vectors, so a
/// slot lookup is a plain index with no indirection on the delivery path.
pub struct WorkSlots {
    slots: [WorkSlot; VECTOR_SPACE],
}

impl WorkSlots {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| WorkSlot::new()),
        }
    }

    pub fn get(&self, vector: Vector) -> &WorkSlot {
        &self.slots[vector as usize]
    }
}

impl Default for WorkSlots {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_consume_complete() {
        let slots = WorkSlots::new();
        let slot = slots.get(42);

        assert!(!slot.is_busy());
        assert!(slot.publish(1_000, 5_000));
        assert!(slot.is_busy());
        assert_eq!(slot.consume(), (1_000, 5_000));

        slot.complete();
        assert!(!slot.is_busy());
    }

    #[test]
    fn test_overrun_detected() {
        let slots = WorkSlots::new();
        let slot = slots.get(42);

        assert!(slot.publish(1_000, 5_000));

        // Publishing again before completion is an overrun, but the new
        // parameters still land.
        assert!(!slot.publish(2_000, 6_000));
        assert_eq!(slot.consume(), (2_000, 6_000));

        slot.complete();
        assert!(slot.publish(3_000, 7_000));
    }

    #[test]
    fn test_slots_are_independent() {
        let slots = WorkSlots::new();
        slots.get(10).publish(1, 1);

        assert!(slots.get(10).is_busy());
        assert!(!slots.get(11).is_busy());
    }
}
