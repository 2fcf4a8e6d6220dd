//! Interrupt playback harness.
//!
//! Replays a scripted schedule of interrupts against a target processor and
//! measures delivery fidelity: how many scheduled interrupts were actually
//! observed by their handler, and how far behind schedule each one landed.
//!
//! The engine is written against the [`hw`] trait seams so it can drive either
//! a real interrupt controller backend or the in-process software controller
//! in [`hw::virt`], which is what the binary and the tests use.

pub mod engine;
pub mod hw;
pub mod trace;
pub mod util;
