use std::collections::HashSet;
use std::future::Future;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use sluice_core::{BatchConfig, ConfigError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::worker::panic_message;
use crate::pressure::monitor::pause;
use crate::pressure::{PressureMonitor, PressureSample, SysinfoProbe};

use super::checkpoint::Checkpoint;
use super::progress::{ObserverId, ProgressObservers, ProgressTracker};
use super::types::{BatchFailure, BatchOutput, BatchProgress, BatchResult};

const GIB: u64 = 1024 * 1024 * 1024;

/// Default batch size for a machine with `total_memory` bytes of RAM.
pub fn adaptive_batch_size(total_memory: u64) -> usize {
    match total_memory {
        m if m < 2 * GIB => 25,
        m if m < 4 * GIB => 50,
        m if m < 8 * GIB => 100,
        m if m < 16 * GIB => 250,
        _ => 500,
    }
}

/// Split `items` into consecutive batches of at most `size` items.
pub(crate) fn plan<T>(items: Vec<T>, size: usize) -> Vec<PlannedBatch<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    let mut start = 0;
    while iter.peek().is_some() {
        let data: Vec<T> = iter.by_ref().take(size).collect();
        let end = start + data.len();
        batches.push(PlannedBatch {
            index: batches.len(),
            items: start..end,
            data,
        });
        start = end;
    }
    batches
}

pub(crate) struct PlannedBatch<T> {
    pub index: usize,
    pub items: Range<usize>,
    pub data: Vec<T>,
}

/// What the pre-batch pressure check did.
struct PressureCheck {
    sample: PressureSample,
    gc_attempts: u32,
    pauses: u32,
}

struct BatchRun<R> {
    index: usize,
    items: Range<usize>,
    duration: Duration,
    outcome: Result<Vec<R>, String>,
}

struct RunState<R> {
    tracker: ProgressTracker,
    outputs: Vec<BatchOutput<R>>,
    errors: Vec<BatchFailure>,
    cancelled: bool,
}

impl<R> RunState<R> {
    fn settle(&mut self, run: BatchRun<R>) -> BatchProgress {
        let BatchRun { index, items, duration, outcome } = run;
        let succeeded = outcome.is_ok();
        self.tracker.record_batch(items.len(), duration, succeeded);
        match outcome {
            Ok(results) => {
                debug!(batch = index, items = items.len(), ?duration, "batch completed");
                self.outputs.push(BatchOutput { index, items, results, duration });
            }
            Err(message) => {
                warn!(batch = index, error = %message, "batch failed, continuing");
                self.errors.push(BatchFailure { index, items, message });
            }
        }
        self.tracker.snapshot(Some(index))
    }

    fn record_check(&mut self, check: PressureCheck) {
        self.tracker.record_pressure(&check.sample);
        self.tracker.record_gc(check.gc_attempts);
        for _ in 0..check.pauses {
            self.tracker.record_pause();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Feeds item collections through a batch function, sequentially or with
/// bounded concurrency, backing off under memory pressure.
pub struct BatchScheduler {
    config: BatchConfig,
    batch_size: usize,
    monitor: Option<PressureMonitor>,
    observers: ProgressObservers,
}

impl BatchScheduler {
    /// A `batch_size` of 0 is resolved from total system memory here.
    pub fn new(config: BatchConfig, monitor: Option<PressureMonitor>) -> Result<Self, ConfigError> {
        config.validate()?;
        let batch_size = if config.batch_size > 0 {
            config.batch_size
        } else {
            let total = monitor
                .as_ref()
                .and_then(|m| m.sample().ok())
                .map(|s| s.system_total_bytes)
                .filter(|total| *total > 0)
                .unwrap_or_else(|| SysinfoProbe::new().total_memory());
            let size = adaptive_batch_size(total);
            info!(total_memory_mb = total / (1024 * 1024), batch_size = size, "Derived batch size from system memory");
            size
        };

        Ok(Self {
            config,
            batch_size,
            monitor,
            observers: ProgressObservers::default(),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn monitor(&self) -> Option<&PressureMonitor> {
        self.monitor.as_ref()
    }

    /// Register a callback run after every settled batch. Errors and panics
    /// from the callback are logged and ignored.
    pub fn on_progress<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&BatchProgress) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.add(Arc::new(callback))
    }

    /// Returns false if `id` was not registered.
    pub fn off_progress(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Run every batch of `items` through `batch_fn(batch, index, token)`.
    ///
    /// A failing or panicking batch is recorded in `errors` and does not stop
    /// the others. Cancelling `token` stops new batches from starting; a batch
    /// already running is left to finish.
    pub async fn process<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        batch_fn: F,
        token: &CancellationToken,
    ) -> BatchResult<R>
    where
        F: Fn(Vec<T>, usize, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        let total_items = items.len();
        let batches = plan(items, self.batch_size);
        let tracker = ProgressTracker::new(batches.len(), total_items, self.config.max_concurrency);
        self.execute(batches, tracker, batch_fn, token).await
    }

    /// Like [`process`](Self::process), but skips batches whose items are all
    /// listed in `checkpoint.processed_items`. Skipped batches count toward
    /// progress; their results live in the checkpoint, not in the returned
    /// `results`.
    pub async fn process_resuming<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        batch_fn: F,
        token: &CancellationToken,
        checkpoint: &Checkpoint,
    ) -> BatchResult<R>
    where
        F: Fn(Vec<T>, usize, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        let done: HashSet<usize> = checkpoint.processed_items.iter().copied().collect();
        let total_items = items.len();
        let (skipped, pending): (Vec<_>, Vec<_>) = plan(items, self.batch_size)
            .into_iter()
            .partition(|b| b.items.clone().all(|i| done.contains(&i)));

        let total_batches = skipped.len() + pending.len();
        let mut tracker = ProgressTracker::new(total_batches, total_items, self.config.max_concurrency);
        tracker.skip(skipped.len(), skipped.iter().map(|b| b.items.len()).sum());
        info!(
            session = %checkpoint.session_id,
            skipped = skipped.len(),
            remaining = pending.len(),
            "Resuming batch run from checkpoint"
        );
        self.execute(pending, tracker, batch_fn, token).await
    }

    async fn execute<T, R, F, Fut>(
        &self,
        batches: Vec<PlannedBatch<T>>,
        tracker: ProgressTracker,
        batch_fn: F,
        token: &CancellationToken,
    ) -> BatchResult<R>
    where
        F: Fn(Vec<T>, usize, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        let concurrency = self.config.max_concurrency;
        let delay = self.config.inter_batch_delay();
        info!(
            "Batch run starting: {} batches of up to {} items (concurrency {})",
            batches.len(),
            self.batch_size,
            concurrency
        );

        let state = Mutex::new(RunState {
            tracker,
            outputs: Vec::new(),
            errors: Vec::new(),
            cancelled: false,
        });

        if concurrency <= 1 {
            for (n, batch) in batches.into_iter().enumerate() {
                if token.is_cancelled() {
                    lock(&state).cancelled = true;
                    break;
                }
                if n > 0 && !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            lock(&state).cancelled = true;
                            break;
                        }
                    }
                }
                self.run_one(batch, &batch_fn, token, &state).await;
            }
        } else {
            let semaphore = Semaphore::new(concurrency);
            let runs = batches.into_iter().map(|batch| {
                let (semaphore, state, batch_fn) = (&semaphore, &state, &batch_fn);
                async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    self.run_one(batch, batch_fn, token, state).await;
                    if !delay.is_zero() {
                        pause(delay, token).await;
                    }
                }
            });
            join_all(runs).await;
        }

        let RunState { tracker, mut outputs, mut errors, cancelled } =
            state.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        outputs.sort_by_key(|o| o.index);
        errors.sort_by_key(|e| e.index);

        let progress = tracker.snapshot(None);
        let metrics = tracker.metrics();
        let success = errors.is_empty() && !cancelled;
        info!(
            "Batch run finished: {}/{} batches ok, {} failed, cancelled={}, {:.1} items/s",
            progress.completed_batches,
            progress.total_batches,
            progress.failed_batches,
            cancelled,
            metrics.items_per_sec
        );

        BatchResult {
            success,
            cancelled,
            results: outputs,
            errors,
            progress,
            metrics,
        }
    }

    async fn run_one<T, R, F, Fut>(
        &self,
        batch: PlannedBatch<T>,
        batch_fn: &F,
        token: &CancellationToken,
        state: &Mutex<RunState<R>>,
    ) where
        F: Fn(Vec<T>, usize, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        if token.is_cancelled() {
            lock(state).cancelled = true;
            return;
        }
        if let Some(check) = self.ease_pressure(token).await {
            lock(state).record_check(check);
        }
        if token.is_cancelled() {
            lock(state).cancelled = true;
            return;
        }

        let PlannedBatch { index, items, data } = batch;
        let started = Instant::now();
        let child = token.clone();
        let outcome = AssertUnwindSafe(async move { batch_fn(data, index, child).await })
            .catch_unwind()
            .await;
        let outcome = match outcome {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!("batch function panicked: {}", panic_message(panic.as_ref()))),
        };

        let run = BatchRun { index, items, duration: started.elapsed(), outcome };
        let progress = lock(state).settle(run);
        self.observers.notify(&progress);
    }

    /// Sample pressure; at high or critical run the bounded GC loop, and if
    /// pressure persists pause once before the batch starts.
    async fn ease_pressure(&self, token: &CancellationToken) -> Option<PressureCheck> {
        if !self.config.pressure_checks {
            return None;
        }
        let monitor = self.monitor.as_ref()?;
        let sample = match monitor.sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "pressure sample failed, skipping check");
                return None;
            }
        };

        let mut check = PressureCheck { sample, gc_attempts: 0, pauses: 0 };
        if !check.sample.level.requires_gc() {
            return Some(check);
        }

        match monitor.relieve_pressure_until(token).await {
            Ok(relief) => {
                check.gc_attempts = relief.attempts;
                check.pauses += u32::from(relief.paused);
                if !relief.relieved() && !token.is_cancelled() {
                    warn!(
                        level = %relief.sample.level,
                        pct = relief.sample.pct,
                        pause = ?self.config.pressure_pause(),
                        "memory pressure persists, pausing before next batch"
                    );
                    if pause(self.config.pressure_pause(), token).await {
                        check.pauses += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "pressure relief failed"),
        }
        Some(check)
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.config)
            .field("batch_size", &self.batch_size)
            .field("monitor", &self.monitor)
            .field("observers", &self.observers.len())
            .finish()
    }
}
