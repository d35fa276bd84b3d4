//! Worker pool runner -- the handle and its control task.
//!
//! Split into focused submodules:
//! - `core`: WorkerPool handle, constructor, and accessor methods
//! - `execution`: task submission, cancellation guard, and teardown requests
//! - `control`: the control task's command loop
//! - `dispatch`: queue-to-worker assignment, worker lifecycle, stats publishing

mod control;
mod core;
mod dispatch;
mod execution;

use tokio::sync::oneshot;

pub use self::core::WorkerPool;

use super::task::{QueuedTask, TaskId};
use super::worker::{WorkerEvent, WorkerId};

/// Messages accepted by the control task.
pub(crate) enum Command {
    Submit(QueuedTask),
    Cancel(TaskId),
    Timeout { task_id: TaskId, worker_id: WorkerId },
    Worker(WorkerEvent),
    Destroy(Option<oneshot::Sender<()>>),
}
