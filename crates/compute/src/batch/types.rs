use std::ops::Range;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pressure::PressureLevel;

/// Progress snapshot handed to observers after every settled batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchProgress {
    pub total_batches: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
    /// Batches already covered by a checkpoint and not rerun.
    pub skipped_batches: usize,
    pub total_items: usize,
    /// Items in settled batches, successful or not, plus skipped ones.
    pub processed_items: usize,
    pub percent: f64,
    /// Rolling mean over batches run in this call.
    pub avg_batch_duration: Duration,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
    pub projected_completion: Option<DateTime<Utc>>,
    /// Index of the batch whose settlement produced this snapshot.
    pub last_batch: Option<usize>,
}

impl BatchProgress {
    pub fn settled_batches(&self) -> usize {
        self.completed_batches + self.failed_batches + self.skipped_batches
    }

    pub fn is_finished(&self) -> bool {
        self.settled_batches() >= self.total_batches
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchMetrics {
    pub total_duration: Duration,
    pub items_per_sec: f64,
    pub avg_batch_duration: Duration,
    pub gc_triggers: u32,
    pub pressure_pauses: u32,
    pub peak_pressure_pct: Option<f64>,
    pub peak_pressure_level: Option<PressureLevel>,
}

/// Results of one successful batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutput<R> {
    pub index: usize,
    /// Input indices this batch covered.
    pub items: Range<usize>,
    pub results: Vec<R>,
    pub duration: Duration,
}

/// A batch function returned an error or panicked.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("batch {index} (items {}..{}) failed: {message}", .items.start, .items.end)]
pub struct BatchFailure {
    pub index: usize,
    pub items: Range<usize>,
    pub message: String,
}

/// Aggregate outcome of `BatchScheduler::process`. Partial failures never
/// abort the run; inspect `success` and `errors`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult<R> {
    /// No batch failed and the run was not cancelled.
    pub success: bool,
    pub cancelled: bool,
    /// Ordered by batch index regardless of completion order.
    pub results: Vec<BatchOutput<R>>,
    /// Ordered by batch index.
    pub errors: Vec<BatchFailure>,
    pub progress: BatchProgress,
    pub metrics: BatchMetrics,
}

impl<R> BatchResult<R> {
    /// Concatenate every batch's results in input order.
    pub fn into_flat_results(self) -> Vec<R> {
        self.results.into_iter().flat_map(|b| b.results).collect()
    }

    /// Input indices covered by successful batches, ascending.
    pub fn processed_item_indices(&self) -> Vec<usize> {
        self.results.iter().flat_map(|b| b.items.clone()).collect()
    }
}
