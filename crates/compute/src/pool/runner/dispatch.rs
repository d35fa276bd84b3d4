use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::pool::stats::PoolStats;
use crate::pool::task::{InFlightTask, QueuedTask, TaskState};
use crate::pool::worker::{Job, WorkerId, WorkerRecord};

use super::control::PoolControl;
use super::Command;

impl PoolControl {
    /// Assign queued tasks to idle workers, growing the pool up to its
    /// ceiling. Tasks stay queued when every worker is busy.
    pub(super) fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let worker_id = match self.bitmap.find_idle() {
                Some(id) if self.is_stalled(id) => self.replace_stalled(id),
                Some(id) => id,
                None if self.workers.len() < self.max_workers => match self.spawn_worker() {
                    Ok(id) => id,
                    Err(e) if self.workers.is_empty() => {
                        // Nothing could ever run this task.
                        warn!(error = %e, "no workers available, failing queued task");
                        if let Some(task) = self.queue.pop_front() {
                            self.metrics.record_terminal(TaskState::Failed, &task.task_type, None);
                            let _ = task.reply.send(Err(e));
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "could not grow pool, task stays queued");
                        break;
                    }
                },
                None => break,
            };

            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.assign(worker_id, task);
        }
        self.publish();
    }

    fn is_stalled(&self, worker_id: WorkerId) -> bool {
        self.workers.get(&worker_id).is_some_and(WorkerRecord::is_stalled)
    }

    /// The lowest idle slot belongs to a thread still inside an abandoned
    /// job. Prefer another idle worker, then a fresh one; fall back to the
    /// stalled worker only when the pool is full.
    fn replace_stalled(&mut self, stalled: WorkerId) -> WorkerId {
        let ready = self
            .workers
            .values()
            .filter(|w| !w.busy && !w.is_stalled())
            .min_by_key(|w| w.slot)
            .map(|w| w.id);
        if let Some(id) = ready {
            return id;
        }
        if self.workers.len() < self.max_workers {
            match self.spawn_worker() {
                Ok(fresh) => return fresh,
                Err(e) => debug!(error = %e, worker_id = %stalled, "could not grow pool, using stalled worker"),
            }
        }
        stalled
    }

    /// Mark the worker busy, send it the job, and arm the task deadline.
    fn assign(&mut self, worker_id: WorkerId, task: QueuedTask) {
        let QueuedTask { id: task_id, task_type, payload, timeout, enqueued_at, reply } = task;

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        let job = Job { task_id, task_type: Arc::clone(&task_type), payload };
        if let Err(job) = worker.send(job) {
            // Thread already gone: drop the worker and put the task back in front.
            warn!(%worker_id, %task_id, "worker channel closed, removing worker");
            self.remove_worker(worker_id);
            self.metrics.faults += 1;
            self.queue.push_front(QueuedTask {
                id: task_id,
                task_type,
                payload: job.payload,
                timeout,
                enqueued_at,
                reply,
            });
            return;
        }

        let now = Instant::now();
        worker.busy = true;
        worker.current_task = Some(task_id);
        worker.busy_since = Some(now);
        worker.last_used = now;
        self.bitmap.mark_busy(worker_id);

        let commands = self.commands.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::Timeout { task_id, worker_id });
        })
        .abort_handle();

        debug!(%task_id, %worker_id, waited = ?enqueued_at.elapsed(), "task dispatched");
        self.in_flight.insert(
            task_id,
            InFlightTask { task_type, worker_id, timeout, reply, timer },
        );
    }

    /// Start a worker thread and register it in the bitmap as idle.
    pub(super) fn spawn_worker(&mut self) -> Result<WorkerId, PoolError> {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;

        let slot = self
            .bitmap
            .insert(id)
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        let record = match WorkerRecord::spawn(id, slot, Arc::clone(&self.registry), self.commands.clone()) {
            Ok(record) => record,
            Err(e) => {
                self.bitmap.remove(id);
                return Err(e);
            }
        };
        self.workers.insert(id, record);
        self.metrics.spawned += 1;
        info!(worker_id = %id, slot, total = self.workers.len(), "spawned worker");
        Ok(id)
    }

    /// Spawn workers until the pool holds `min_workers`.
    pub(super) fn replenish(&mut self) -> Result<(), PoolError> {
        while self.workers.len() < self.config.min_workers {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Return a worker to idle after its task settled.
    pub(super) fn release_worker(&mut self, worker_id: WorkerId, completed: bool, errored: bool) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        let now = Instant::now();
        if let Some(since) = worker.busy_since.take() {
            worker.busy_time += now.duration_since(since);
        }
        worker.busy = false;
        worker.current_task = None;
        worker.last_used = now;
        if completed {
            worker.tasks_completed += 1;
        }
        if errored {
            worker.error_count += 1;
        }
        self.bitmap.mark_idle(worker_id);
    }

    /// Drop a worker from the map and free its bitmap slot. Closing its job
    /// channel ends the thread once it is idle.
    pub(super) fn remove_worker(&mut self, worker_id: WorkerId) -> Option<WorkerRecord> {
        let worker = self.workers.remove(&worker_id)?;
        self.bitmap.remove(worker_id);
        Some(worker)
    }

    /// Evict workers beyond `min_workers` that have been idle for at least
    /// `idle_timeout`, oldest first.
    pub(super) fn evict_idle(&mut self) {
        let excess = self.workers.len().saturating_sub(self.config.min_workers);
        if excess == 0 {
            return;
        }
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();

        let mut stale: Vec<(Instant, WorkerId)> = self
            .workers
            .values()
            .filter(|w| !w.busy && now.duration_since(w.last_used) >= idle_timeout)
            .map(|w| (w.last_used, w.id))
            .collect();
        if stale.is_empty() {
            return;
        }
        stale.sort();

        for (_, worker_id) in stale.into_iter().take(excess) {
            if self.remove_worker(worker_id).is_some() {
                self.metrics.evicted += 1;
                info!(%worker_id, remaining = self.workers.len(), "evicted idle worker");
            }
        }
        self.publish();
    }

    /// Write the stats snapshot read by [`crate::WorkerPool::stats`].
    pub(super) fn publish(&self) {
        let now = Instant::now();
        let mut workers: Vec<_> = self.workers.values().map(|w| w.snapshot(now)).collect();
        workers.sort_by_key(|w| w.slot);

        let total = self.workers.len();
        let idle = self.bitmap.idle_count();
        let busy = total.saturating_sub(idle);
        let m = &self.metrics;

        let snapshot = PoolStats {
            total_workers: total,
            busy_workers: busy,
            idle_workers: idle,
            queued_tasks: self.queue.len(),
            in_flight_tasks: self.in_flight.len(),
            completed_tasks: m.completed,
            failed_tasks: m.failed,
            timed_out_tasks: m.timed_out,
            cancelled_tasks: m.cancelled,
            worker_faults: m.faults,
            workers_spawned: m.spawned,
            workers_evicted: m.evicted,
            avg_task_duration: m.avg_task_duration,
            utilization_pct: if total == 0 { 0.0 } else { busy as f64 / total as f64 * 100.0 },
            tasks_by_type: m.tasks_by_type.clone(),
            destroyed: self.destroyed,
            workers,
        };

        match self.stats.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}
