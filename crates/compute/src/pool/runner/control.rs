use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use sluice_core::PoolConfig;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::pool::bitmap::IdleBitmap;
use crate::pool::handler::HandlerRegistry;
use crate::pool::stats::{PoolMetrics, PoolStats};
use crate::pool::task::{InFlightTask, QueuedTask, TaskId, TaskState};
use crate::pool::worker::{WorkerEvent, WorkerId, WorkerRecord};

use super::Command;

/// Sole owner of the pool's scheduling state. Runs as one Tokio task.
pub(super) struct PoolControl {
    pub(super) config: PoolConfig,
    pub(super) max_workers: usize,
    pub(super) registry: Arc<HandlerRegistry>,
    /// Cloned into worker threads and deadline timers.
    pub(super) commands: UnboundedSender<Command>,
    pub(super) workers: HashMap<WorkerId, WorkerRecord>,
    pub(super) bitmap: IdleBitmap,
    pub(super) queue: VecDeque<QueuedTask>,
    pub(super) in_flight: HashMap<TaskId, InFlightTask>,
    pub(super) next_worker_id: u64,
    pub(super) metrics: PoolMetrics,
    pub(super) stats: Arc<RwLock<PoolStats>>,
    pub(super) destroyed: bool,
}

impl PoolControl {
    pub(super) fn new(
        config: PoolConfig,
        registry: Arc<HandlerRegistry>,
        commands: UnboundedSender<Command>,
        stats: Arc<RwLock<PoolStats>>,
    ) -> Self {
        let max_workers = config.resolved_max_workers();
        Self {
            config,
            max_workers,
            registry,
            commands,
            workers: HashMap::new(),
            bitmap: IdleBitmap::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            next_worker_id: 1,
            metrics: PoolMetrics::default(),
            stats,
            destroyed: false,
        }
    }

    /// Process commands until the pool is destroyed or every sender is gone.
    ///
    /// Idle eviction runs on a Tokio interval; like every pool timer it never
    /// keeps the runtime alive on its own.
    pub(super) async fn run(mut self, mut inbox: UnboundedReceiver<Command>) {
        let mut eviction = tokio::time::interval(self.config.eviction_interval());
        eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        eviction.tick().await;

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(Command::Destroy(ack)) => {
                        self.teardown();
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.teardown();
                        break;
                    }
                },
                _ = eviction.tick() => self.evict_idle(),
            }
        }

        debug!("pool control task stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(task) => {
                debug!(task_id = %task.id, task_type = %task.task_type, "task queued");
                self.queue.push_back(task);
                self.dispatch();
            }
            Command::Cancel(task_id) => self.cancel(task_id),
            Command::Timeout { task_id, worker_id } => self.time_out(task_id, worker_id),
            Command::Worker(event) => self.on_worker_event(event),
            // Handled by the run loop.
            Command::Destroy(_) => {}
        }
    }

    fn cancel(&mut self, task_id: TaskId) {
        if let Some(pos) = self.queue.iter().position(|t| t.id == task_id) {
            if let Some(task) = self.queue.remove(pos) {
                debug!(%task_id, "cancelled before dispatch");
                self.metrics.record_terminal(TaskState::Cancelled, &task.task_type, None);
                self.publish();
            }
            return;
        }

        if let Some(task) = self.in_flight.remove(&task_id) {
            debug!(%task_id, worker_id = %task.worker_id, "cancelled after dispatch, freeing worker");
            self.release_worker(task.worker_id, false, false);
            self.abandon(task.worker_id);
            self.metrics.record_terminal(TaskState::Cancelled, &task.task_type, None);
            self.publish();
            task.settle(Err(PoolError::Aborted));
            self.dispatch();
        }
    }

    fn time_out(&mut self, task_id: TaskId, worker_id: WorkerId) {
        let matches = self
            .in_flight
            .get(&task_id)
            .is_some_and(|t| t.worker_id == worker_id);
        if !matches {
            return;
        }
        let Some(task) = self.in_flight.remove(&task_id) else {
            return;
        };

        warn!(%task_id, %worker_id, timeout = ?task.timeout, "task timed out, worker returned to idle");
        self.release_worker(worker_id, false, false);
        self.abandon(worker_id);
        self.metrics.record_terminal(TaskState::TimedOut, &task.task_type, None);
        self.publish();
        let timeout = task.timeout;
        task.settle(Err(PoolError::TaskTimeout { task_id, timeout }));
        self.dispatch();
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Completed { worker_id, task_id, result, elapsed } => {
                let Some(task) = self.take_current(worker_id, task_id) else {
                    debug!(%task_id, %worker_id, "discarding result of abandoned task");
                    self.settle_abandoned(worker_id);
                    return;
                };
                debug!(%task_id, %worker_id, ?elapsed, "task completed");
                self.release_worker(worker_id, true, false);
                self.metrics.record_terminal(TaskState::Completed, &task.task_type, Some(elapsed));
                self.publish();
                task.settle(Ok(result));
                self.dispatch();
            }
            WorkerEvent::Failed { worker_id, task_id, message, elapsed } => {
                let Some(task) = self.take_current(worker_id, task_id) else {
                    debug!(%task_id, %worker_id, "discarding failure of abandoned task");
                    self.settle_abandoned(worker_id);
                    return;
                };
                debug!(%task_id, %worker_id, ?elapsed, error = %message, "task failed");
                self.release_worker(worker_id, false, true);
                self.metrics.record_terminal(TaskState::Failed, &task.task_type, None);
                self.publish();
                task.settle(Err(PoolError::TaskFailed { task_id, message }));
                self.dispatch();
            }
            WorkerEvent::Fault { worker_id, task_id, reason } => {
                self.on_worker_fault(worker_id, task_id, reason);
            }
        }
    }

    /// The worker's thread is gone. Fail whatever it was running, drop it,
    /// and restore the minimum pool size.
    fn on_worker_fault(&mut self, worker_id: WorkerId, task_id: TaskId, reason: String) {
        let Some(worker) = self.remove_worker(worker_id) else {
            return;
        };
        self.metrics.faults += 1;
        warn!(%worker_id, %task_id, %reason, "worker faulted and was removed from the pool");

        // The faulting task may already have timed out; whatever the worker
        // holds now was queued behind it on the dead thread.
        let failed = worker.current_task.and_then(|current| self.in_flight.remove(&current));
        if let Some(task) = &failed {
            self.metrics.record_terminal(TaskState::Failed, &task.task_type, None);
        }

        if self.workers.len() < self.config.min_workers {
            if let Err(e) = self.replenish() {
                warn!(error = %e, "failed to replace faulted worker");
            }
        }
        self.publish();

        if let Some(task) = failed {
            task.settle(Err(PoolError::WorkerFault { worker_id, reason }));
        }
        self.dispatch();
    }

    /// The worker's thread is still inside a job the pool gave up on.
    fn abandon(&mut self, worker_id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.abandoned += 1;
        }
    }

    /// An abandoned job finished; once none remain the worker is preferred
    /// again by dispatch.
    fn settle_abandoned(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        worker.abandoned = worker.abandoned.saturating_sub(1);
        if !worker.is_stalled() && !self.queue.is_empty() {
            self.dispatch();
        }
    }

    /// Remove the in-flight entry only if it is what the worker is running.
    fn take_current(&mut self, worker_id: WorkerId, task_id: TaskId) -> Option<InFlightTask> {
        let is_current = self
            .workers
            .get(&worker_id)
            .is_some_and(|w| w.current_task == Some(task_id));
        if !is_current {
            return None;
        }
        self.in_flight.remove(&task_id)
    }

    /// Reject everything outstanding and release all workers.
    pub(super) fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let queued: Vec<QueuedTask> = self.queue.drain(..).collect();
        let in_flight: Vec<InFlightTask> = self.in_flight.drain().map(|(_, t)| t).collect();

        // Closing each job channel lets the threads exit once idle.
        let workers = self.workers.len();
        self.workers.clear();
        self.bitmap = IdleBitmap::new();
        self.publish();

        let (queued_count, in_flight_count) = (queued.len(), in_flight.len());
        for task in queued {
            let _ = task.reply.send(Err(PoolError::PoolDestroyed));
        }
        for task in in_flight {
            task.settle(Err(PoolError::PoolDestroyed));
        }

        info!(
            "Worker pool destroyed: released {} workers, rejected {} queued and {} in-flight tasks",
            workers, queued_count, in_flight_count
        );
    }
}
