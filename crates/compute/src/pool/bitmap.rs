//! Packed idle-worker bitmap.
//!
//! Bit *i* set means the worker in slot *i* is idle. Finding an idle worker
//! isolates the lowest set bit (`bits & -bits`) and converts it to a slot
//! index, so lookup cost does not depend on pool size. The width caps the
//! pool at [`BITMAP_WIDTH`] workers; inserting past that fails with
//! [`BitmapFull`] instead of wrapping.

use std::collections::HashMap;

use sluice_core::MAX_POOL_WORKERS;
use thiserror::Error;

use super::worker::WorkerId;

/// Number of slots, and therefore the hard ceiling on pool size.
pub const BITMAP_WIDTH: usize = MAX_POOL_WORKERS;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("idle bitmap is full ({BITMAP_WIDTH} slots)")]
pub struct BitmapFull;

/// Idle/busy state for up to [`BITMAP_WIDTH`] workers.
///
/// A worker keeps its slot for its whole lifetime; slots are reused only
/// after [`IdleBitmap::remove`].
#[derive(Debug)]
pub struct IdleBitmap {
    /// Bit set = slot holds an idle worker.
    idle: u32,
    /// Bit set = slot is assigned to some worker.
    occupied: u32,
    slot_of: HashMap<WorkerId, u32>,
    worker_at: [Option<WorkerId>; BITMAP_WIDTH],
}

impl Default for IdleBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleBitmap {
    pub fn new() -> Self {
        Self {
            idle: 0,
            occupied: 0,
            slot_of: HashMap::new(),
            worker_at: [None; BITMAP_WIDTH],
        }
    }

    /// Register a worker in the lowest free slot, marked idle.
    pub fn insert(&mut self, worker: WorkerId) -> Result<u32, BitmapFull> {
        if let Some(&slot) = self.slot_of.get(&worker) {
            return Ok(slot);
        }
        let free = !self.occupied;
        if free == 0 {
            return Err(BitmapFull);
        }
        let slot = free.trailing_zeros();
        let bit = 1u32 << slot;
        self.occupied |= bit;
        self.idle |= bit;
        self.slot_of.insert(worker, slot);
        self.worker_at[slot as usize] = Some(worker);
        Ok(slot)
    }

    /// Release a worker's slot. Returns the slot it occupied.
    pub fn remove(&mut self, worker: WorkerId) -> Option<u32> {
        let slot = self.slot_of.remove(&worker)?;
        let bit = 1u32 << slot;
        self.occupied &= !bit;
        self.idle &= !bit;
        self.worker_at[slot as usize] = None;
        Some(slot)
    }

    /// Lowest-slot idle worker, if any. O(1).
    pub fn find_idle(&self) -> Option<WorkerId> {
        if self.idle == 0 {
            return None;
        }
        let lowest = self.idle & self.idle.wrapping_neg();
        self.worker_at[lowest.trailing_zeros() as usize]
    }

    pub fn mark_busy(&mut self, worker: WorkerId) -> bool {
        match self.slot_of.get(&worker) {
            Some(&slot) => {
                self.idle &= !(1u32 << slot);
                true
            }
            None => false,
        }
    }

    pub fn mark_idle(&mut self, worker: WorkerId) -> bool {
        match self.slot_of.get(&worker) {
            Some(&slot) => {
                self.idle |= 1u32 << slot;
                true
            }
            None => false,
        }
    }

    /// `None` when the worker is not registered.
    pub fn is_idle(&self, worker: WorkerId) -> Option<bool> {
        self.slot_of
            .get(&worker)
            .map(|&slot| self.idle & (1u32 << slot) != 0)
    }

    pub fn slot(&self, worker: WorkerId) -> Option<u32> {
        self.slot_of.get(&worker).copied()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.count_ones() as usize
    }

    pub fn len(&self) -> usize {
        self.slot_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_of.is_empty()
    }
}
