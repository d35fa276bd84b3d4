pub mod batch;
pub mod error;
pub mod global;
pub mod pool;
pub mod pressure;

pub use batch::{BatchFailure, BatchProgress, BatchResult, BatchScheduler, Checkpoint, ObserverId};
pub use error::{CheckpointError, PoolError, PressureError};
pub use pool::{HandlerRegistry, PoolStats, TaskHandler, TaskOptions, WorkerPool};
pub use pressure::{GcOutcome, GcStatus, PressureLevel, PressureMonitor, PressureSample};
