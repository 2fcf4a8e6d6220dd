//! Hardware capability seams.
//!
//! The playback engine never touches an interrupt controller, clock, or delay
//! mechanism directly; it goes through the traits in this module. The
//! [`virt`] submodule provides the in-process software implementation used by
//! the binary and the tests. A kernel-resident port would implement the same
//! traits over the real vector table and inter-processor interrupt mechanism.

use std::sync::Arc;

use thiserror::Error;

pub mod virt;

/// A concrete hardware interrupt vector number.
pub type Vector = u8;

/// Size of the vector space addressable by a [`Vector`].
pub const VECTOR_SPACE: usize = 256;

/// Identifies a target processor for directed signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(pub u32);

impl std::fmt::Display for CpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Errors raised while reserving vectors or installing handlers.
///
/// Setup is a one-shot action; both variants are terminal for the invocation
/// that raised them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    /// No contiguous run of unreserved vectors of the requested length.
    #[error("no contiguous range of {count} vectors available")]
    NoContiguousRange { count: usize },

    /// The vector already has a handler installed.
    #[error("vector {vector} already has a handler assigned")]
    VectorBusy { vector: Vector },
}

/// A monotonic nanosecond clock.
pub trait ClockSource: Send + Sync {
    /// Read the current monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;
}

/// Blocks the calling context for a given duration.
///
/// Implementations must be usable both from ordinary threads and from within
/// a handler invocation, so they must not assume a scheduler is available.
pub trait DelayPrimitive: Send + Sync {
    /// Block the caller for at least `ns` nanoseconds.
    fn delay_ns(&self, ns: u64);
}

/// The routine invoked when a mapped vector fires.
pub trait InterruptHandler: Send + Sync {
    /// Handle one delivery of `vector`.
    ///
    /// Runs asynchronously on the target processor's dispatch context.
    /// Further deliveries to the same processor are deferred (or lost) until
    /// the handler signals [`InterruptController::end_of_interrupt`].
    fn handle(&self, vector: Vector);
}

/// The vector-table and signal backend.
pub trait InterruptController: Send + Sync {
    /// Atomically reserve `count` contiguous vectors, returning the first.
    fn reserve_range(&self, count: usize) -> Result<Vector, SetupError>;

    /// Release a previously reserved range.
    fn release_range(&self, first: Vector, count: usize);

    /// Install `handler` on `vector`. Fails if the vector is occupied.
    fn assign_handler(
        &self,
        vector: Vector,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<(), SetupError>;

    /// Remove any handler installed on `vector`.
    fn clear_handler(&self, vector: Vector);

    /// Send a directed signal naming `vector` to processor `cpu`.
    ///
    /// Delivery is asynchronous; the call returns as soon as the signal is
    /// posted. A signal posted to a vector that is already pending on the
    /// destination processor is coalesced with it, i.e. lost.
    fn send_ipi(&self, cpu: CpuId, vector: Vector);

    /// Signal completion of the in-progress handler invocation on the
    /// calling processor, re-enabling further deliveries.
    fn end_of_interrupt(&self);
}
