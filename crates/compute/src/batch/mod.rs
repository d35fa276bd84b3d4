//! Memory-pressure-aware batch scheduling.
//!
//! [`BatchScheduler::process`] partitions an item collection into fixed-size
//! batches and runs them one after another, or under a semaphore when
//! `max_concurrency > 1`. Before each batch it consults the
//! [`PressureMonitor`](crate::pressure::PressureMonitor), if one is attached.
//! Failed batches are collected, never fatal.

pub mod checkpoint;
pub mod progress;
pub mod scheduler;
pub mod types;

pub use checkpoint::Checkpoint;
pub use progress::ObserverId;
pub use scheduler::{adaptive_batch_size, BatchScheduler};
pub use types::{BatchFailure, BatchMetrics, BatchOutput, BatchProgress, BatchResult};
