use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::CheckpointError;

use super::types::{BatchFailure, BatchResult};

/// Resumable record of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Input indices covered by successful batches, ascending.
    pub processed_items: Vec<usize>,
    /// One past the highest successful batch index.
    pub current_batch: usize,
    /// Per-batch results as a JSON array of `{index, results}` objects.
    pub results: Value,
    pub errors: Vec<BatchFailure>,
}

impl Checkpoint {
    /// Write atomically: serialize to a sibling temp file, then rename.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = temp_path(path);
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        info!(
            path = %path.display(),
            session = %self.session_id,
            processed = self.processed_items.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Serialize)]
struct BatchRecord<'a, R> {
    index: usize,
    results: &'a [R],
}

impl<R: Serialize> BatchResult<R> {
    /// Snapshot this run for a later `process_resuming`.
    pub fn checkpoint(&self, session_id: Uuid) -> Result<Checkpoint, CheckpointError> {
        let records: Vec<_> = self
            .results
            .iter()
            .map(|batch| BatchRecord { index: batch.index, results: &batch.results })
            .collect();

        Ok(Checkpoint {
            session_id,
            timestamp: Utc::now(),
            processed_items: self.processed_item_indices(),
            current_batch: self.results.last().map_or(0, |b| b.index + 1),
            results: serde_json::to_value(records)?,
            errors: self.errors.clone(),
        })
    }
}
