use std::sync::atomic::Ordering;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PoolError;
use crate::pool::task::{QueuedTask, TaskId, TaskOptions};

use super::core::WorkerPool;
use super::Command;

/// Tells the control task to drop a task if the caller stops waiting early.
struct CancelOnDrop {
    task_id: TaskId,
    commands: UnboundedSender<Command>,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::Cancel(self.task_id));
        }
    }
}

impl WorkerPool {
    /// Run `payload` through the handler registered for `task_type`.
    ///
    /// Resolves when the worker responds, the task's deadline passes
    /// ([`PoolError::TaskTimeout`]), or its cancellation token fires
    /// ([`PoolError::Aborted`]). A token that is already cancelled aborts
    /// before anything is queued. Dropping the returned future counts as
    /// cancellation.
    pub async fn execute(
        &self,
        task_type: &str,
        payload: Value,
        options: TaskOptions,
    ) -> Result<Value, PoolError> {
        if self.is_destroyed() {
            return Err(PoolError::PoolDestroyed);
        }
        let token = options.cancellation.unwrap_or_else(CancellationToken::new);
        if token.is_cancelled() {
            debug!(task_type, "cancellation already signalled, not submitting");
            return Err(PoolError::Aborted);
        }
        let task_type = self.shared.registry.resolve(task_type)?;

        let task_id = TaskId(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed));
        let timeout = options.timeout.unwrap_or_else(|| self.shared.config.task_timeout());
        let (reply, outcome) = oneshot::channel();

        let task = QueuedTask {
            id: task_id,
            task_type,
            payload,
            timeout,
            enqueued_at: Instant::now(),
            reply,
        };
        self.shared
            .commands
            .send(Command::Submit(task))
            .map_err(|_| PoolError::PoolDestroyed)?;

        let mut guard = CancelOnDrop {
            task_id,
            commands: self.shared.commands.clone(),
            armed: true,
        };

        tokio::select! {
            biased;
            settled = outcome => {
                guard.disarm();
                // Sender dropped without a reply: the control task is gone.
                settled.unwrap_or(Err(PoolError::PoolDestroyed))
            }
            _ = token.cancelled() => {
                debug!(%task_id, "task cancelled by caller");
                Err(PoolError::Aborted)
            }
        }
    }

    /// Reject all queued and in-flight tasks with [`PoolError::PoolDestroyed`]
    /// and release every worker. Idempotent.
    ///
    /// Worker threads are not joined: a thread inside a handler finishes that
    /// job and then exits on its own.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Worker pool destroy requested");
        let (ack, done) = oneshot::channel();
        if self.shared.commands.send(Command::Destroy(Some(ack))).is_ok() {
            let _ = done.await;
        }
    }
}
