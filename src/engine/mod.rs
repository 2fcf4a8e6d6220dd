//! The interrupt playback engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::hw::{ClockSource, CpuId, DelayPrimitive, InterruptController, InterruptHandler};
use crate::trace::{IrqId, Trace};
use crate::util::clock::clock_overhead;
use crate::util::stats::{LatencyDigest, ReservoirSampler};

mod handler;
mod report;
mod slots;
mod vectors;

use handler::{ReplayHandler, LATENCY_SAMPLES};

pub use handler::{BlockingWork, DeferredWork, SimulatedWork};
pub use report::{dropped, RunReport};
pub use slots::{WorkSlot, WorkSlots};
pub use vectors::VectorMap;

/// Playback tuning knobs.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Gap between "now" at the start of playback and the reference time the
    /// trace offsets are measured from. Gives the first entry room to be
    /// published and waited for like every other entry.
    pub lead_ns: u64,

    /// How long to wait after the last signal for in-flight handler
    /// invocations to finish before reading the arrival counter.
    pub drain: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            lead_ns: 1_000,
            drain: Duration::from_secs(10),
        }
    }
}

/// The playback engine.
///
/// Owns every piece of mutable state the run touches: the IRQ-to-vector map,
/// the per-vector work slots, the arrival counter, and the lateness samples.
/// The arrival counter deliberately persists across `play` calls on the same
/// engine; reports are computed from run-local deltas.
pub struct ReplayEngine {
    controller: Arc<dyn InterruptController>,
    clock: Arc<dyn ClockSource>,
    slots: Arc<WorkSlots>,
    arrivals: Arc<AtomicU64>,
    latency: Arc<ReservoirSampler<LATENCY_SAMPLES>>,
    handler: Arc<dyn InterruptHandler>,
    vectors: Option<VectorMap>,
    config: ReplayConfig,
}

impl ReplayEngine {
    /// Create an engine over the given hardware capabilities.
    ///
    /// # Arguments
    ///
    /// * `controller` - The vector-table and signal backend.
    /// * `clock` - Monotonic clock shared by the player and the handler.
    /// * `delay` - Delay primitive the handler's simulated work runs on.
    /// * `work` - Work execution policy, blocking or deferred.
    /// * `config` - Playback tuning knobs.
    pub fn new(
        controller: Arc<dyn InterruptController>,
        clock: Arc<dyn ClockSource>,
        delay: Arc<dyn DelayPrimitive>,
        work: Box<dyn SimulatedWork>,
        config: ReplayConfig,
    ) -> Self {
        let slots = Arc::new(WorkSlots::new());
        let arrivals = Arc::new(AtomicU64::new(0));
        let latency = Arc::new(ReservoirSampler::new());
        let handler: Arc<dyn InterruptHandler> = Arc::new(ReplayHandler::new(
            Arc::clone(&slots),
            Arc::clone(&arrivals),
            Arc::clone(&latency),
            Arc::clone(&clock),
            delay,
            work,
            Arc::downgrade(&controller),
        ));

        Self {
            controller,
            clock,
            slots,
            arrivals,
            latency,
            handler,
            vectors: None,
            config,
        }
    }

    /// Reserve vectors and install the handler for the given IRQ set.
    ///
    /// Idempotent: once a mapping exists, further calls are no-ops and the
    /// existing mapping is kept, whatever IRQ set they pass. On failure the
    /// partially built reservation is rolled back and the engine stays
    /// un-set-up.
    pub fn setup(&mut self, irqs: &[IrqId]) -> Result<()> {
        if self.vectors.is_some() {
            return Ok(());
        }

        let mut seen = [false; 256];
        for irq in irqs {
            if std::mem::replace(&mut seen[irq.index()], true) {
                return Err(anyhow!("duplicate IRQ identifier {irq}"));
            }
        }

        let map = VectorMap::reserve(&*self.controller, irqs, &self.handler)
            .context("interrupt setup failed")?;
        self.vectors = Some(map);
        Ok(())
    }

    /// The current IRQ-to-vector mapping, if setup has run.
    pub fn vector_map(&self) -> Option<&VectorMap> {
        self.vectors.as_ref()
    }

    /// Raw lifetime arrival count. Survives across runs; difference two
    /// readings to get a run-local count.
    pub fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::SeqCst)
    }

    /// Replay `trace` against processor `target`.
    ///
    /// For each entry in order: publish the entry's work parameters into its
    /// vector's slot, busy-wait (spinning, never yielding) until the
    /// calibrated target time, then send the directed signal. An entry whose
    /// offset has already passed fires immediately; that compression is a
    /// measured outcome, not an error. After the last entry the player waits
    /// out the drain interval so in-flight handler invocations can finish,
    /// then computes the report from the run-local arrival delta.
    ///
    /// Caller obligation: the trace's inter-entry spacing must leave room
    /// for each firing's handler work to finish before the same IRQ fires
    /// again; violations are surfaced as slot overruns in the report.
    pub fn play(&self, trace: &Trace, target: CpuId) -> Result<RunReport> {
        let map = self
            .vectors
            .as_ref()
            .ok_or_else(|| anyhow!("playback requires setup to have succeeded"))?;

        let overhead = clock_overhead(&*self.clock);
        self.latency.reset();
        let before = self.arrivals.load(Ordering::SeqCst);
        let mut slot_overruns = 0u64;

        // Deadline arithmetic saturates: a schema-valid offset near the top
        // of the range must not wrap into the past.
        let start = self.clock.now_ns().saturating_add(self.config.lead_ns);
        for entry in trace.entries() {
            let vector = map
                .vector(entry.irq)
                .ok_or_else(|| anyhow!("{} is not mapped to a vector", entry.irq))?;

            let deadline = start.saturating_add(entry.offset_ns);
            if !self.slots.get(vector).publish(entry.duration_ns, deadline) {
                slot_overruns += 1;
            }

            // Spin right up to the calibrated deadline. Immediately false if
            // the offset has already passed.
            let wait_until = deadline.saturating_sub(overhead);
            while self.clock.now_ns() < wait_until {
                std::hint::spin_loop();
            }

            self.controller.send_ipi(target, vector);
        }

        thread::sleep(self.config.drain);

        let observed = self.arrivals.load(Ordering::SeqCst) - before;
        let mut digest = LatencyDigest::new();
        digest.add_all(&self.latency);

        Ok(RunReport {
            scheduled: trace.len(),
            observed,
            dropped: dropped(trace.len(), observed),
            clock_overhead_ns: overhead,
            slot_overruns,
            latency: digest.estimates(),
        })
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;
    use more_asserts::assert_le;

    use super::*;
    use crate::hw::virt::VirtIntc;
    use crate::hw::SetupError;
    use crate::trace::TraceEntry;
    use crate::util::clock::{MonotonicClock, SpinDelay};

    fn entry(irq: u8, offset_ns: u64, duration_ns: u64) -> TraceEntry {
        TraceEntry {
            irq: IrqId(irq),
            offset_ns,
            duration_ns,
        }
    }

    // Serializes the wall-clock tests; their spin loops distort each
    // other's timing when the suite runs them in parallel on small hosts.
    static TIMING: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn timing_guard() -> std::sync::MutexGuard<'static, ()> {
        TIMING.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn engine(controller: Arc<dyn InterruptController>, drain: Duration) -> ReplayEngine {
        let clock: Arc<dyn ClockSource> = Arc::new(MonotonicClock::new());
        let delay = Arc::new(SpinDelay::new(Arc::clone(&clock)));
        ReplayEngine::new(
            controller,
            clock,
            delay,
            Box::new(BlockingWork),
            ReplayConfig {
                lead_ns: 1_000,
                drain,
            },
        )
    }

    #[test]
    fn test_setup_is_idempotent() -> Result<()> {
        let intc = VirtIntc::new(0)?;
        let mut engine = engine(intc.clone(), Duration::ZERO);

        engine.setup(&[IrqId(1), IrqId(2)])?;
        let first = engine.vector_map().unwrap().first();

        // Second call is a no-op: same mapping, no new reservation.
        engine.setup(&[IrqId(1), IrqId(2)])?;
        assert_eq!(engine.vector_map().unwrap().first(), first);
        assert_eq!(intc.reserve_range(1)?, first + 2);
        Ok(())
    }

    #[test]
    fn test_setup_rejects_duplicate_irqs() -> Result<()> {
        let intc = VirtIntc::new(0)?;
        let mut engine = engine(intc, Duration::ZERO);

        assert!(engine.setup(&[IrqId(1), IrqId(1)]).is_err());
        assert!(engine.vector_map().is_none());
        Ok(())
    }

    #[test]
    fn test_setup_failure_is_reported() -> Result<()> {
        let intc = VirtIntc::new(0)?;
        let mut engine = engine(intc, Duration::ZERO);

        // More IRQs than the vector space can hold.
        let irqs: Vec<IrqId> = (0..=255).map(IrqId).collect();
        let err = engine.setup(&irqs).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SetupError>(),
            Some(&SetupError::NoContiguousRange { count: 256 })
        );
        Ok(())
    }

    #[test]
    fn test_play_requires_setup() -> Result<()> {
        let intc = VirtIntc::new(1)?;
        let engine = engine(intc, Duration::ZERO);

        let trace = Trace::new(vec![IrqId(1)], vec![entry(1, 0, 0)])?;
        assert!(engine.play(&trace, CpuId(0)).is_err());
        Ok(())
    }

    #[test]
    fn test_extreme_offset_saturates_instead_of_wrapping() -> Result<()> {
        struct PeggedClock;

        impl ClockSource for PeggedClock {
            fn now_ns(&self) -> u64 {
                u64::MAX
            }
        }

        let intc = VirtIntc::new(1)?;
        let clock: Arc<dyn ClockSource> = Arc::new(PeggedClock);
        let delay = Arc::new(SpinDelay::new(Arc::clone(&clock)));
        let mut engine = ReplayEngine::new(
            intc.clone(),
            clock,
            delay,
            Box::new(BlockingWork),
            ReplayConfig {
                lead_ns: 1_000,
                drain: Duration::ZERO,
            },
        );
        engine.setup(&[IrqId(1)])?;

        // An offset at the top of the range is schema-valid; its deadline
        // clamps to u64::MAX instead of wrapping into the past and must not
        // abort the run.
        let trace = Trace::new(vec![IrqId(1)], vec![entry(1, u64::MAX, 0)])?;
        let report = engine.play(&trace, CpuId(0))?;
        assert_eq!(report.scheduled, 1);
        Ok(())
    }

    #[test]
    fn test_widely_spaced_trace_drops_nothing() -> Result<()> {
        let _timing = timing_guard();
        let intc = VirtIntc::new(2)?;
        let mut engine = engine(intc.clone(), Duration::from_millis(200));
        engine.setup(&[IrqId(1), IrqId(2)])?;

        // Spacing (5ms) is far larger than the handler work (100us).
        let trace = Trace::new(
            vec![IrqId(1), IrqId(2)],
            vec![entry(1, 0, 100_000), entry(2, 5_000_000, 100_000)],
        )?;
        let report = engine.play(&trace, CpuId(1))?;

        assert_eq!(report.observed, 2);
        assert_eq!(report.dropped, 0);
        assert_eq!(report.slot_overruns, 0);
        assert_eq!(report.latency.count, 2);
        assert_eq!(intc.missed_eoi(), 0);

        // Both vectors fired, in schedule order.
        let map = engine.vector_map().unwrap();
        assert_eq!(
            intc.delivery_log(),
            vec![
                map.vector(IrqId(1)).unwrap(),
                map.vector(IrqId(2)).unwrap()
            ]
        );
        Ok(())
    }

    #[test]
    fn test_occupancy_induces_drops() -> Result<()> {
        let _timing = timing_guard();
        let intc = VirtIntc::new(1)?;
        let mut engine = engine(intc.clone(), Duration::from_millis(250));
        engine.setup(&[IrqId(1)])?;

        // The first firing occupies the handler for 40ms, far longer than
        // the 1ms gaps to the re-firings of the same IRQ.
        let trace = Trace::new(
            vec![IrqId(1)],
            vec![
                entry(1, 0, 40_000_000),
                entry(1, 1_000_000, 0),
                entry(1, 2_000_000, 0),
            ],
        )?;
        let report = engine.play(&trace, CpuId(0))?;

        assert_ge!(report.dropped, 1);
        assert_le!(report.observed, 2);
        assert_ge!(intc.coalesced(), 1);
        assert_ge!(report.slot_overruns, 1);
        Ok(())
    }

    #[test]
    fn test_reference_trace_end_to_end() -> Result<()> {
        let _timing = timing_guard();
        let intc = VirtIntc::new(2)?;
        let mut engine = engine(intc.clone(), Duration::from_millis(100));

        let trace = Trace::demo();
        engine.setup(trace.irqs())?;
        let report = engine.play(&trace, CpuId(1))?;

        assert_eq!(report.observed, 2);
        assert_eq!(report.dropped, 0);

        let map = engine.vector_map().unwrap();
        assert_eq!(
            intc.delivery_log(),
            vec![
                map.vector(IrqId(1)).unwrap(),
                map.vector(IrqId(2)).unwrap()
            ]
        );
        Ok(())
    }

    #[test]
    fn test_arrival_counter_persists_across_runs() -> Result<()> {
        let _timing = timing_guard();
        let intc = VirtIntc::new(1)?;
        let mut engine = engine(intc, Duration::from_millis(100));
        engine.setup(&[IrqId(1), IrqId(2)])?;

        let trace = Trace::new(
            vec![IrqId(1), IrqId(2)],
            vec![entry(1, 0, 0), entry(2, 2_000_000, 0)],
        )?;

        let first = engine.play(&trace, CpuId(0))?;
        let second = engine.play(&trace, CpuId(0))?;

        // Each report is run-local even though the counter accumulates.
        assert_eq!(first.observed, 2);
        assert_eq!(second.observed, 2);
        assert_eq!(second.dropped, 0);
        assert_eq!(engine.arrivals(), 4);
        Ok(())
    }
}
