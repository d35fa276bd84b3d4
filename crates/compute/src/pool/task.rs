use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PoolError;

use super::worker::WorkerId;

/// Opaque task identity, unique per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a submitted task. Exactly one terminal state is ever reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Queued,
    Assigned,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }
}

/// Per-call options for [`crate::WorkerPool::execute`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Deadline counted from dispatch. Falls back to `pool.task_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Signalling this settles the call with [`PoolError::Aborted`].
    pub cancellation: Option<CancellationToken>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) type TaskReply = oneshot::Sender<Result<Value, PoolError>>;

/// A task waiting for an idle worker.
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub task_type: Arc<str>,
    pub payload: Value,
    pub timeout: Duration,
    pub enqueued_at: Instant,
    pub reply: TaskReply,
}

/// A task handed to a worker and not yet settled.
pub(crate) struct InFlightTask {
    pub task_type: Arc<str>,
    pub worker_id: WorkerId,
    pub timeout: Duration,
    pub reply: TaskReply,
    pub timer: AbortHandle,
}

impl InFlightTask {
    /// Settle the caller's future. The deadline timer is disarmed first.
    pub fn settle(self, outcome: Result<Value, PoolError>) {
        self.timer.abort();
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply.send(outcome);
    }
}
