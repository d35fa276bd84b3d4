//! Memory pressure sampling, classification, and manual GC.
//!
//! [`PressureMonitor`] reads counters through a [`MemoryProbe`], classifies
//! the larger of heap and system usage into a [`PressureLevel`], and runs a
//! [`GcHook`] when pressure is high. Every GC trigger lands in a bounded
//! history that [`PressureMonitor::analyze_effectiveness`] summarizes.

pub mod gc;
pub mod monitor;
pub mod probe;
pub mod types;

pub use gc::{default_gc_hook, FnGcHook, GcHook};
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub use gc::MallocTrim;
pub use monitor::PressureMonitor;
pub use probe::{MemoryProbe, MemoryReading, SysinfoProbe};
pub use types::{
    classify, EffectivenessReport, GcOutcome, GcRating, GcStatus, PressureLevel, PressureSample,
    RecommendedAction, ReliefOutcome,
};
