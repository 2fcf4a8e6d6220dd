//! The interrupt handler and simulated work policies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::engine::slots::WorkSlots;
use crate::hw::{ClockSource, DelayPrimitive, InterruptController, InterruptHandler, Vector};
use crate::util::stats::ReservoirSampler;

/// Capacity of the in-handler lateness reservoir.
pub(crate) const LATENCY_SAMPLES: usize = 4096;

/// How the handler performs the simulated per-interrupt work.
pub trait SimulatedWork: Send + Sync {
    /// Perform `duration_ns` worth of simulated work.
    fn execute(&self, duration_ns: u64, delay: &dyn DelayPrimitive);
}

/// Burn the duration inside the handler, before end-of-interrupt.
///
/// This is the faithful policy: while the work runs, the target processor
/// cannot take further interrupts, which is exactly the occupancy phenomenon
/// the harness measures.
pub struct BlockingWork;

impl SimulatedWork for BlockingWork {
    fn execute(&self, duration_ns: u64, delay: &dyn DelayPrimitive) {
        delay.delay_ns(duration_ns);
    }
}

/// Hand the work to a detached task and return immediately.
///
/// The safer policy for environments where blocking in delivery context is
/// unacceptable; with it the handler occupies the processor only for its own
/// bookkeeping, so occupancy-induced drops mostly disappear.
pub struct DeferredWork;

impl SimulatedWork for DeferredWork {
    fn execute(&self, duration_ns: u64, _delay: &dyn DelayPrimitive) {
        std::thread::spawn(move || std::thread::sleep(Duration::from_nanos(duration_ns)));
    }
}

/// The routine run on every delivery of a mapped vector.
///
/// Reads the vector's work slot, bumps the arrival counter, samples how far
/// behind its intended fire time the delivery landed, performs the simulated
/// work, and signals end-of-interrupt.
pub(crate) struct ReplayHandler {
    slots: Arc<WorkSlots>,
    arrivals: Arc<AtomicU64>,
    latency: Arc<ReservoirSampler<LATENCY_SAMPLES>>,
    clock: Arc<dyn ClockSource>,
    delay: Arc<dyn DelayPrimitive>,
    work: Box<dyn SimulatedWork>,
    controller: Weak<dyn InterruptController>,
}

impl ReplayHandler {
    pub(crate) fn new(
        slots: Arc<WorkSlots>,
        arrivals: Arc<AtomicU64>,
        latency: Arc<ReservoirSampler<LATENCY_SAMPLES>>,
        clock: Arc<dyn ClockSource>,
        delay: Arc<dyn DelayPrimitive>,
        work: Box<dyn SimulatedWork>,
        controller: Weak<dyn InterruptController>,
    ) -> Self {
        Self {
            slots,
            arrivals,
            latency,
            clock,
            delay,
            work,
            controller,
        }
    }
}

impl InterruptHandler for ReplayHandler {
    fn handle(&self, vector: Vector) {
        let slot = self.slots.get(vector);
        let (duration_ns, deadline_ns) = slot.consume();

        self.arrivals.fetch_add(1, Ordering::SeqCst);
        self.latency
            .sample(self.clock.now_ns().saturating_sub(deadline_ns));

        self.work.execute(duration_ns, &*self.delay);
        slot.complete();

        if let Some(controller) = self.controller.upgrade() {
            controller.end_of_interrupt();
        }
    }
}
