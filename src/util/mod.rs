pub mod affinity;
pub mod clock;
pub mod stats;
