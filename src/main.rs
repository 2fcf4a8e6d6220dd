use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::ArgAction;
use clap::Parser;

use irqreplay::engine::{
    BlockingWork, DeferredWork, ReplayConfig, ReplayEngine, SimulatedWork,
};
use irqreplay::hw::virt::VirtIntc;
use irqreplay::hw::{ClockSource, CpuId, InterruptController};
use irqreplay::trace::Trace;
use irqreplay::util::clock::{clock_overhead, MonotonicClock, SpinDelay};

/// Command line arguments for the irqreplay binary.
#[derive(Parser, Debug)]
#[command(
    name = "irqreplay",
    about = "Interrupt playback harness",
    long_about = "Replays a scripted schedule of interrupts against a target processor and \
                 reports delivery fidelity: how many scheduled interrupts the handler actually \
                 observed, and how far behind schedule each delivery landed.\n\n\
                 Interrupts are delivered through an in-process software controller with one \
                 dispatch thread per simulated processor; the handler blocks inside delivery \
                 context for each entry's simulated work duration, so a dense enough schedule \
                 will drop interrupts exactly the way an occupied interrupt thread does."
)]
struct Args {
    /// Trace file (JSON). Runs the built-in reference trace when omitted.
    #[arg(long, default_value = None)]
    trace: Option<PathBuf>,

    /// Number of simulated processors.
    #[arg(long, default_value_t = 2)]
    cpus: usize,

    /// Processor the interrupts are directed at.
    #[arg(long, default_value_t = 1)]
    target_cpu: u32,

    /// Lead time from the start of playback to the trace's reference time,
    /// in nanoseconds.
    #[arg(long, default_value_t = 1_000)]
    lead_ns: u64,

    /// Drain interval after the last entry, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    drain_ms: u64,

    /// Run the simulated work on a detached task instead of blocking inside
    /// the handler.
    #[arg(long, action = ArgAction::SetTrue)]
    deferred_work: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let trace = match &args.trace {
        Some(path) => Trace::load(path)?,
        None => Trace::demo(),
    };

    let intc = VirtIntc::new(args.cpus)?;
    if args.target_cpu as usize >= intc.num_cpus() {
        bail!(
            "target cpu {} out of range: {} processors simulated",
            args.target_cpu,
            intc.num_cpus()
        );
    }

    let clock: Arc<dyn ClockSource> = Arc::new(MonotonicClock::new());
    let delay = Arc::new(SpinDelay::new(Arc::clone(&clock)));
    let work: Box<dyn SimulatedWork> = if args.deferred_work {
        Box::new(DeferredWork)
    } else {
        Box::new(BlockingWork)
    };

    let controller: Arc<dyn InterruptController> = intc.clone();
    let mut engine = ReplayEngine::new(
        controller,
        Arc::clone(&clock),
        delay,
        work,
        ReplayConfig {
            lead_ns: args.lead_ns,
            drain: Duration::from_millis(args.drain_ms),
        },
    );
    engine.setup(trace.irqs())?;

    // The first estimate after process start is skewed by clock-path
    // warm-up, so take and discard one before the measured run.
    eprintln!(
        "discarding warm-up calibration ({} ns)",
        clock_overhead(&*clock)
    );
    eprintln!(
        "replaying {} entries across {} IRQs at {}",
        trace.len(),
        trace.irqs().len(),
        CpuId(args.target_cpu)
    );

    let report = engine.play(&trace, CpuId(args.target_cpu))?;

    println!("avg clock overhead: {} ns", report.clock_overhead_ns);
    println!("replay done");
    println!("dropped interrupts: {}", report.dropped);
    if report.slot_overruns > 0 {
        println!("slot overruns: {}", report.slot_overruns);
    }
    if intc.coalesced() > 0 {
        println!("coalesced signals: {}", intc.coalesced());
    }
    println!("delivery lateness: {}", report.latency);

    Ok(())
}
