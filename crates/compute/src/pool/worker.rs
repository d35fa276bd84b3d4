//! Worker threads and the pool's per-worker bookkeeping.
//!
//! Each worker is a dedicated OS thread that receives [`Job`]s over its own
//! channel and reports every outcome back to the control task as a
//! [`WorkerEvent`]. A worker runs one job at a time.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::PoolError;

use super::handler::HandlerRegistry;
use super::runner::Command;
use super::task::TaskId;

/// Opaque worker identity. Never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Message sent to a worker thread.
pub(crate) struct Job {
    pub task_id: TaskId,
    pub task_type: Arc<str>,
    pub payload: Value,
}

/// Message sent from a worker thread to the control task.
pub(crate) enum WorkerEvent {
    Completed {
        worker_id: WorkerId,
        task_id: TaskId,
        result: Value,
        elapsed: Duration,
    },
    Failed {
        worker_id: WorkerId,
        task_id: TaskId,
        message: String,
        elapsed: Duration,
    },
    /// The handler panicked; the thread has exited.
    Fault {
        worker_id: WorkerId,
        task_id: TaskId,
        reason: String,
    },
}

/// Read-only view of one worker, exposed through pool stats.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub slot: u32,
    pub busy: bool,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub busy_time: Duration,
    pub idle_for: Option<Duration>,
    pub error_count: u64,
    /// Timed-out or cancelled jobs still running on the thread.
    pub abandoned_jobs: u32,
}

/// Pool-side record of a live worker. Owned exclusively by the control task.
pub(crate) struct WorkerRecord {
    pub id: WorkerId,
    pub slot: u32,
    jobs: mpsc::Sender<Job>,
    // Dropped without joining: a thread stuck in a handler must not block the pool.
    _thread: JoinHandle<()>,
    pub busy: bool,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub busy_time: Duration,
    pub busy_since: Option<Instant>,
    pub last_used: Instant,
    pub error_count: u64,
    /// Timed-out or cancelled jobs the thread is still running. Reported
    /// idle, but the next job would queue behind them.
    pub abandoned: u32,
}

impl WorkerRecord {
    /// Start a worker thread. The record starts idle.
    pub fn spawn(
        id: WorkerId,
        slot: u32,
        registry: Arc<HandlerRegistry>,
        events: UnboundedSender<Command>,
    ) -> Result<Self, PoolError> {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("sluice-{id}"))
            .spawn(move || run_worker(id, jobs_rx, registry, events))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        Ok(Self {
            id,
            slot,
            jobs: jobs_tx,
            _thread: thread,
            busy: false,
            current_task: None,
            tasks_completed: 0,
            busy_time: Duration::ZERO,
            busy_since: None,
            last_used: Instant::now(),
            error_count: 0,
            abandoned: 0,
        })
    }

    /// Still running a job nobody is waiting for.
    pub fn is_stalled(&self) -> bool {
        self.abandoned > 0
    }

    /// Hand a job to the thread. Gives the job back if the thread is gone.
    pub fn send(&self, job: Job) -> Result<(), Job> {
        self.jobs.send(job).map_err(|e| e.0)
    }

    pub fn snapshot(&self, now: Instant) -> WorkerSnapshot {
        let live_busy = self.busy_since.map(|s| now.duration_since(s)).unwrap_or_default();
        WorkerSnapshot {
            id: self.id,
            slot: self.slot,
            busy: self.busy,
            current_task: self.current_task,
            tasks_completed: self.tasks_completed,
            busy_time: self.busy_time + live_busy,
            idle_for: (!self.busy).then(|| now.duration_since(self.last_used)),
            error_count: self.error_count,
            abandoned_jobs: self.abandoned,
        }
    }
}

fn run_worker(
    id: WorkerId,
    jobs: mpsc::Receiver<Job>,
    registry: Arc<HandlerRegistry>,
    events: UnboundedSender<Command>,
) {
    debug!(worker_id = %id, "worker thread started");

    // Channel closes when the pool evicts this worker or is destroyed.
    while let Ok(job) = jobs.recv() {
        let Job { task_id, task_type, payload } = job;
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| registry.invoke(&task_type, payload)));
        let elapsed = started.elapsed();

        let event = match outcome {
            Ok(Ok(result)) => WorkerEvent::Completed { worker_id: id, task_id, result, elapsed },
            Ok(Err(e)) => WorkerEvent::Failed {
                worker_id: id,
                task_id,
                message: format!("{e:#}"),
                elapsed,
            },
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(worker_id = %id, %task_id, %reason, "handler panicked, worker exiting");
                let _ = events.send(Command::Worker(WorkerEvent::Fault { worker_id: id, task_id, reason }));
                return;
            }
        };

        if events.send(Command::Worker(event)).is_err() {
            break;
        }
    }

    debug!(worker_id = %id, "worker thread exiting");
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}
