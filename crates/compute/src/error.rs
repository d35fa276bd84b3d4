use std::time::Duration;

use sluice_core::ConfigError;
use thiserror::Error;

use crate::pool::{TaskId, WorkerId};

/// Errors settled into the future returned by [`crate::WorkerPool::execute`]
/// or raised while building a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool has been destroyed")]
    PoolDestroyed,

    #[error("task aborted by cancellation")]
    Aborted,

    #[error("{task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: TaskId, timeout: Duration },

    #[error("{worker_id} faulted: {reason}")]
    WorkerFault { worker_id: WorkerId, reason: String },

    #[error("{task_id} failed: {message}")]
    TaskFailed { task_id: TaskId, message: String },

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("handler already registered for task type: {0}")]
    DuplicateHandler(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("a live default pool is already installed")]
    AlreadyInstalled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from the pressure monitor. An unavailable GC hook is reported
/// through [`crate::pressure::GcStatus::Unavailable`], never as an error.
#[derive(Debug, Error)]
pub enum PressureError {
    #[error("memory probe failed: {0}")]
    Probe(String),

    #[error("pressure monitoring requires a tokio runtime: {0}")]
    Runtime(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors persisting or restoring a batch checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
