use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use super::task::TaskState;
use super::worker::WorkerSnapshot;

/// Pool snapshot returned by [`crate::WorkerPool::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    /// Tasks waiting for a worker.
    pub queued_tasks: usize,
    /// Tasks assigned to a worker and not yet settled.
    pub in_flight_tasks: usize,
    pub completed_tasks: u64,
    /// Handler errors plus tasks lost to worker faults.
    pub failed_tasks: u64,
    pub timed_out_tasks: u64,
    pub cancelled_tasks: u64,
    pub worker_faults: u64,
    pub workers_spawned: u64,
    pub workers_evicted: u64,
    /// Mean handler run time over completed tasks.
    pub avg_task_duration: Duration,
    /// Busy workers as a percentage of all workers.
    pub utilization_pct: f64,
    /// Completed tasks by task type.
    pub tasks_by_type: HashMap<String, u64>,
    pub destroyed: bool,
    pub workers: Vec<WorkerSnapshot>,
}

/// Running counters kept by the control task.
#[derive(Debug, Clone, Default)]
pub(crate) struct PoolMetrics {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub faults: u64,
    pub spawned: u64,
    pub evicted: u64,
    pub avg_task_duration: Duration,
    pub tasks_by_type: HashMap<String, u64>,
}

impl PoolMetrics {
    /// Record a task reaching a terminal state.
    pub fn record_terminal(&mut self, state: TaskState, task_type: &str, elapsed: Option<Duration>) {
        match state {
            TaskState::Completed => {
                self.completed += 1;
                *self.tasks_by_type.entry(task_type.to_string()).or_default() += 1;
                if let Some(duration) = elapsed {
                    self.update_average(duration);
                }
            }
            TaskState::Failed => self.failed += 1,
            TaskState::TimedOut => self.timed_out += 1,
            TaskState::Cancelled => self.cancelled += 1,
            TaskState::Queued | TaskState::Assigned => {}
        }
    }

    // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
    fn update_average(&mut self, duration: Duration) {
        let count = self.completed;
        self.avg_task_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_task_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_completion() {
        let mut m = PoolMetrics::default();
        m.record_terminal(TaskState::Completed, "hash", Some(Duration::from_millis(100)));

        assert_eq!(m.completed, 1);
        assert_eq!(m.tasks_by_type["hash"], 1);
        assert_eq!(m.avg_task_duration, Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_completions_averages() {
        let mut m = PoolMetrics::default();
        m.record_terminal(TaskState::Completed, "hash", Some(Duration::from_millis(100)));
        m.record_terminal(TaskState::Completed, "hash", Some(Duration::from_millis(200)));

        let avg = m.avg_task_duration.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn non_completions_do_not_move_average() {
        let mut m = PoolMetrics::default();
        m.record_terminal(TaskState::Completed, "hash", Some(Duration::from_millis(10)));
        m.record_terminal(TaskState::Failed, "hash", None);
        m.record_terminal(TaskState::TimedOut, "hash", None);
        m.record_terminal(TaskState::Cancelled, "hash", None);

        assert_eq!(m.completed, 1);
        assert_eq!(m.failed, 1);
        assert_eq!(m.timed_out, 1);
        assert_eq!(m.cancelled, 1);
        assert_eq!(m.avg_task_duration, Duration::from_millis(10));
    }
}
