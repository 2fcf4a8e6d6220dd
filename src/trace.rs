//! The replay trace: a scripted interrupt schedule.

use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Logical name for an interrupt source, distinct from the hardware vector
/// it is mapped to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IrqId(pub u8);

impl IrqId {
    /// The identifier as an array index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for IrqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq{}", self.0)
    }
}

/// One scheduled interrupt: which source fires, when (relative to the run's
/// reference start time), and how much handler work it simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub irq: IrqId,
    pub offset_ns: u64,
    pub duration_ns: u64,
}

#[derive(Deserialize)]
struct RawTrace {
    irqs: Vec<IrqId>,
    entries: Vec<TraceEntry>,
}

/// A validated interrupt schedule.
///
/// Construction enforces the schema: the declared IRQ identifiers are
/// distinct and non-empty, every entry names a declared IRQ, and offsets are
/// non-decreasing (playback is strictly in order).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTrace")]
pub struct Trace {
    irqs: Vec<IrqId>,
    entries: Vec<TraceEntry>,
}

impl TryFrom<RawTrace> for Trace {
    type Error = anyhow::Error;

    fn try_from(raw: RawTrace) -> Result<Self> {
        Trace::new(raw.irqs, raw.entries)
    }
}

impl Trace {
    /// Build a trace, validating the schema.
    pub fn new(irqs: Vec<IrqId>, entries: Vec<TraceEntry>) -> Result<Self> {
        if irqs.is_empty() {
            return Err(anyhow!("trace declares no IRQ identifiers"));
        }

        let mut seen = [false; 256];
        for irq in &irqs {
            if std::mem::replace(&mut seen[irq.index()], true) {
                return Err(anyhow!("duplicate IRQ identifier {irq}"));
            }
        }

        let mut last_offset = 0u64;
        for entry in &entries {
            if !seen[entry.irq.index()] {
                return Err(anyhow!(
                    "trace entry names undeclared IRQ identifier {}",
                    entry.irq
                ));
            }
            if entry.offset_ns < last_offset {
                return Err(anyhow!(
                    "trace offsets must be non-decreasing ({} ns after {} ns)",
                    entry.offset_ns,
                    last_offset
                ));
            }
            last_offset = entry.offset_ns;
        }

        Ok(Self { irqs, entries })
    }

    /// Parse a trace from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse trace")
    }

    /// Load a trace from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read trace file {}", path.display()))?;
        Self::from_json(&json)
    }

    /// The built-in reference schedule: two sources, one firing almost
    /// immediately and one 10us in.
    pub fn demo() -> Self {
        Self::new(
            vec![IrqId(1), IrqId(2)],
            vec![
                TraceEntry {
                    irq: IrqId(1),
                    offset_ns: 5,
                    duration_ns: 10,
                },
                TraceEntry {
                    irq: IrqId(2),
                    offset_ns: 10_000,
                    duration_ns: 15,
                },
            ],
        )
        .expect("built-in trace is valid")
    }

    /// The declared IRQ identifiers, in declaration order.
    pub fn irqs(&self) -> &[IrqId] {
        &self.irqs
    }

    /// The scheduled entries, in playback order.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Number of scheduled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
