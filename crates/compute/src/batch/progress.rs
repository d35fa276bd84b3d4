use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::warn;

use crate::pool::worker::panic_message;
use crate::pressure::PressureSample;

use super::types::{BatchMetrics, BatchProgress};

type ProgressCallback = Arc<dyn Fn(&BatchProgress) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `on_progress`, used to unregister the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Registered progress observers.
#[derive(Default)]
pub(crate) struct ProgressObservers {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, ProgressCallback)>>,
}

impl ProgressObservers {
    pub(crate) fn add(&self, callback: ProgressCallback) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Call every observer. Errors and panics are logged and swallowed.
    pub(crate) fn notify(&self, progress: &BatchProgress) {
        // Snapshot so observers may (un)register without deadlocking.
        let observers: Vec<_> = self.lock().clone();
        for (id, callback) in observers {
            match catch_unwind(AssertUnwindSafe(|| callback(progress))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(observer = %id, error = %e, "progress observer failed"),
                Err(panic) => warn!(
                    observer = %id,
                    reason = %panic_message(panic.as_ref()),
                    "progress observer panicked"
                ),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ObserverId, ProgressCallback)>> {
        self.observers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Mutable counters behind one `process` call.
pub(crate) struct ProgressTracker {
    started: Instant,
    concurrency: usize,
    total_batches: usize,
    total_items: usize,
    completed_batches: usize,
    failed_batches: usize,
    skipped_batches: usize,
    processed_items: usize,
    avg_batch_duration: Duration,
    timed_batches: u32,
    gc_triggers: u32,
    pressure_pauses: u32,
    peak: Option<PressureSample>,
}

impl ProgressTracker {
    pub(crate) fn new(total_batches: usize, total_items: usize, concurrency: usize) -> Self {
        Self {
            started: Instant::now(),
            concurrency: concurrency.max(1),
            total_batches,
            total_items,
            completed_batches: 0,
            failed_batches: 0,
            skipped_batches: 0,
            processed_items: 0,
            avg_batch_duration: Duration::ZERO,
            timed_batches: 0,
            gc_triggers: 0,
            pressure_pauses: 0,
            peak: None,
        }
    }

    /// Credit batches restored from a checkpoint.
    pub(crate) fn skip(&mut self, batches: usize, items: usize) {
        self.skipped_batches += batches;
        self.processed_items += items;
    }

    pub(crate) fn record_batch(&mut self, items: usize, duration: Duration, succeeded: bool) {
        if succeeded {
            self.completed_batches += 1;
        } else {
            self.failed_batches += 1;
        }
        self.processed_items += items;

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.timed_batches += 1;
        let prev = self.avg_batch_duration.as_nanos() as f64;
        let cur = duration.as_nanos() as f64;
        let avg = prev + (cur - prev) / self.timed_batches as f64;
        self.avg_batch_duration = Duration::from_nanos(avg as u64);
    }

    pub(crate) fn record_pressure(&mut self, sample: &PressureSample) {
        if self.peak.as_ref().map_or(true, |peak| sample.pct > peak.pct) {
            self.peak = Some(sample.clone());
        }
    }

    pub(crate) fn record_gc(&mut self, attempts: u32) {
        self.gc_triggers += attempts;
    }

    pub(crate) fn record_pause(&mut self) {
        self.pressure_pauses += 1;
    }

    pub(crate) fn snapshot(&self, last_batch: Option<usize>) -> BatchProgress {
        let settled = self.completed_batches + self.failed_batches + self.skipped_batches;
        let remaining = self.total_batches.saturating_sub(settled);
        let percent = if self.total_batches == 0 {
            100.0
        } else {
            settled as f64 / self.total_batches as f64 * 100.0
        };

        let estimated_remaining = if remaining == 0 {
            Some(Duration::ZERO)
        } else if self.timed_batches == 0 {
            None
        } else {
            let waves = remaining.div_ceil(self.concurrency) as u32;
            Some(self.avg_batch_duration * waves)
        };
        let projected_completion = estimated_remaining
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        BatchProgress {
            total_batches: self.total_batches,
            completed_batches: self.completed_batches,
            failed_batches: self.failed_batches,
            skipped_batches: self.skipped_batches,
            total_items: self.total_items,
            processed_items: self.processed_items,
            percent,
            avg_batch_duration: self.avg_batch_duration,
            elapsed: self.started.elapsed(),
            estimated_remaining,
            projected_completion,
            last_batch,
        }
    }

    pub(crate) fn metrics(&self) -> BatchMetrics {
        let total_duration = self.started.elapsed();
        let secs = total_duration.as_secs_f64();
        let run_items = self.processed_items as f64;
        BatchMetrics {
            total_duration,
            items_per_sec: if secs > 0.0 { run_items / secs } else { 0.0 },
            avg_batch_duration: self.avg_batch_duration,
            gc_triggers: self.gc_triggers,
            pressure_pauses: self.pressure_pauses,
            peak_pressure_pct: self.peak.as_ref().map(|s| s.pct),
            peak_pressure_level: self.peak.as_ref().map(|s| s.level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn observers_register_and_unregister() {
        let observers = ProgressObservers::default();
        let a = observers.add(Arc::new(|_| Ok(())));
        let b = observers.add(Arc::new(|_| Ok(())));
        assert_ne!(a, b);
        assert_eq!(observers.len(), 2);
        assert!(observers.remove(a));
        assert!(!observers.remove(a));
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn failing_observers_do_not_stop_others() {
        let observers = ProgressObservers::default();
        let calls = Arc::new(AtomicUsize::new(0));
        observers.add(Arc::new(|_| anyhow::bail!("observer broke")));
        observers.add(Arc::new(|_| panic!("observer exploded")));
        let counter = Arc::clone(&calls);
        observers.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        observers.notify(&BatchProgress::default());
        observers.notify(&BatchProgress::default());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tracker_averages_and_estimates() {
        let mut tracker = ProgressTracker::new(4, 40, 1);
        tracker.record_batch(10, Duration::from_millis(100), true);
        tracker.record_batch(10, Duration::from_millis(300), false);

        let progress = tracker.snapshot(Some(1));
        assert_eq!(progress.completed_batches, 1);
        assert_eq!(progress.failed_batches, 1);
        assert_eq!(progress.processed_items, 20);
        assert!((progress.percent - 50.0).abs() < 1e-9);
        assert_eq!(progress.avg_batch_duration, Duration::from_millis(200));
        assert_eq!(progress.estimated_remaining, Some(Duration::from_millis(400)));
        assert!(progress.projected_completion.is_some());
        assert_eq!(progress.last_batch, Some(1));
    }

    #[test]
    fn estimate_accounts_for_concurrency() {
        let mut tracker = ProgressTracker::new(5, 50, 2);
        tracker.record_batch(10, Duration::from_millis(100), true);
        // 4 left at 2 in flight: two more waves.
        assert_eq!(
            tracker.snapshot(None).estimated_remaining,
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn no_estimate_before_first_batch() {
        let tracker = ProgressTracker::new(3, 30, 1);
        let progress = tracker.snapshot(None);
        assert_eq!(progress.estimated_remaining, None);
        assert_eq!(progress.projected_completion, None);
    }

    #[test]
    fn empty_run_is_complete() {
        let tracker = ProgressTracker::new(0, 0, 1);
        let progress = tracker.snapshot(None);
        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.estimated_remaining, Some(Duration::ZERO));
    }
}
