//! In-process software interrupt controller.
//!
//! Models the parts of a hardware controller the playback engine cares
//! about: a 256-entry vector table with contiguous reservation, directed
//! signals posted as per-vector pending bits, and one dispatch thread per
//! simulated processor that delivers pending vectors to their handlers one
//! at a time. A signal posted while the same vector is already pending is
//! coalesced (lost), and a handler that blocks defers every other vector on
//! that processor until it returns — exactly the occupancy behaviour the
//! harness exists to measure.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};

use crate::hw::{
    CpuId, InterruptController, InterruptHandler, SetupError, Vector, VECTOR_SPACE,
};
use crate::util::affinity;

/// Vectors below this are treated as architecture-reserved and never handed
/// out by [`InterruptController::reserve_range`].
const FIRST_ALLOCATABLE: usize = 32;

struct VectorTable {
    reserved: [bool; VECTOR_SPACE],
    handlers: [Option<Arc<dyn InterruptHandler>>; VECTOR_SPACE],
}

/// Per-processor delivery state.
struct CpuState {
    /// One pending bit per vector; a second signal while the bit is set is
    /// coalesced into the first.
    pending: [AtomicBool; VECTOR_SPACE],

    /// Set before a handler runs, cleared by end-of-interrupt.
    eoi_pending: AtomicBool,

    /// Signals lost to an already-set pending bit.
    coalesced: AtomicU64,

    /// Handler invocations that returned without signalling end-of-interrupt.
    missed_eoi: AtomicU64,

    stop: AtomicBool,
}

impl CpuState {
    fn new() -> Self {
        Self {
            pending: std::array::from_fn(|_| AtomicBool::new(false)),
            eoi_pending: AtomicBool::new(false),
            coalesced: AtomicU64::new(0),
            missed_eoi: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }
}

struct Shared {
    table: Mutex<VectorTable>,
    cpus: Vec<Arc<CpuState>>,
    log: Mutex<Vec<Vector>>,
}

thread_local! {
    /// The processor the current thread dispatches for, if any. Lets
    /// end-of-interrupt find its processor without plumbing a CPU id through
    /// every handler.
    static CURRENT_CPU: RefCell<Option<Arc<CpuState>>> = const { RefCell::new(None) };
}

/// Dispatch loop run by each simulated processor.
fn dispatch_loop(shared: Arc<Shared>, cpu: Arc<CpuState>) {
    CURRENT_CPU.with(|c| *c.borrow_mut() = Some(Arc::clone(&cpu)));

    while !cpu.stop.load(Ordering::Acquire) {
        let mut delivered = false;

        for vector in 0..VECTOR_SPACE {
            if !cpu.pending[vector].swap(false, Ordering::AcqRel) {
                continue;
            }
            delivered = true;

            let handler = shared.table.lock().unwrap().handlers[vector].clone();
            if let Some(handler) = handler {
                shared.log.lock().unwrap().push(vector as Vector);
                cpu.eoi_pending.store(true, Ordering::Release);
                handler.handle(vector as Vector);
                if cpu.eoi_pending.swap(false, Ordering::AcqRel) {
                    cpu.missed_eoi.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if !delivered {
            thread::yield_now();
        }
    }
}

/// The software interrupt controller.
///
/// Owns one dispatch thread per simulated processor; the threads are stopped
/// and joined on drop.
pub struct VirtIntc {
    shared: Arc<Shared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl VirtIntc {
    /// Create a controller with `num_cpus` simulated processors.
    ///
    /// Each dispatch thread is pinned, best effort, to the host CPU with the
    /// same index so directed signals exercise real cross-CPU delivery.
    pub fn new(num_cpus: usize) -> Result<Arc<Self>> {
        let mut table = VectorTable {
            reserved: [false; VECTOR_SPACE],
            handlers: std::array::from_fn(|_| None),
        };
        for slot in table.reserved.iter_mut().take(FIRST_ALLOCATABLE) {
            *slot = true;
        }

        let cpus: Vec<Arc<CpuState>> = (0..num_cpus).map(|_| Arc::new(CpuState::new())).collect();
        let shared = Arc::new(Shared {
            table: Mutex::new(table),
            cpus,
            log: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::with_capacity(num_cpus);
        for i in 0..num_cpus {
            let shared = Arc::clone(&shared);
            let cpu = Arc::clone(&shared.cpus[i]);
            let handle = thread::Builder::new()
                .name(format!("virq{i}"))
                .spawn(move || {
                    let _ = affinity::pin_to_cpu(i as u32);
                    dispatch_loop(shared, cpu);
                })
                .with_context(|| format!("failed to spawn dispatch thread for cpu{i}"))?;
            threads.push(handle);
        }

        Ok(Arc::new(Self {
            shared,
            threads: Mutex::new(threads),
        }))
    }

    /// Number of simulated processors; valid signal targets are below this.
    pub fn num_cpus(&self) -> usize {
        self.shared.cpus.len()
    }

    /// The sequence of vectors delivered so far, across all processors.
    pub fn delivery_log(&self) -> Vec<Vector> {
        self.shared.log.lock().unwrap().clone()
    }

    /// Total signals lost to coalescing, across all processors.
    pub fn coalesced(&self) -> u64 {
        self.shared
            .cpus
            .iter()
            .map(|c| c.coalesced.load(Ordering::Relaxed))
            .sum()
    }

    /// Total handler invocations that never signalled end-of-interrupt.
    pub fn missed_eoi(&self) -> u64 {
        self.shared
            .cpus
            .iter()
            .map(|c| c.missed_eoi.load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for VirtIntc {
    fn drop(&mut self) {
        for cpu in &self.shared.cpus {
            cpu.stop.store(true, Ordering::Release);
        }
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl InterruptController for VirtIntc {
    fn reserve_range(&self, count: usize) -> Result<Vector, SetupError> {
        if count == 0 || count > VECTOR_SPACE - FIRST_ALLOCATABLE {
            return Err(SetupError::NoContiguousRange { count });
        }

        let mut table = self.shared.table.lock().unwrap();
        let mut run = 0;
        for vector in FIRST_ALLOCATABLE..VECTOR_SPACE {
            if table.reserved[vector] {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = vector + 1 - count;
                for v in first..=vector {
                    table.reserved[v] = true;
                }
                return Ok(first as Vector);
            }
        }
        Err(SetupError::NoContiguousRange { count })
    }

    fn release_range(&self, first: Vector, count: usize) {
        let mut table = self.shared.table.lock().unwrap();
        let first = first as usize;
        for v in first..(first + count).min(VECTOR_SPACE) {
            table.reserved[v] = false;
        }
    }

    fn assign_handler(
        &self,
        vector: Vector,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<(), SetupError> {
        let mut table = self.shared.table.lock().unwrap();
        let slot = &mut table.handlers[vector as usize];
        if slot.is_some() {
            return Err(SetupError::VectorBusy { vector });
        }
        *slot = Some(handler);
        Ok(())
    }

    fn clear_handler(&self, vector: Vector) {
        self.shared.table.lock().unwrap().handlers[vector as usize] = None;
    }

    fn send_ipi(&self, cpu: CpuId, vector: Vector) {
        let Some(state) = self.shared.cpus.get(cpu.0 as usize) else {
            return;
        };
        if state.pending[vector as usize].swap(true, Ordering::AcqRel) {
            state.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn end_of_interrupt(&self) {
        CURRENT_CPU.with(|c| {
            if let Some(cpu) = c.borrow().as_ref() {
                cpu.eoi_pending.store(false, Ordering::Release);
            }
        });
    }
}
