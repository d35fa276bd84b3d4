//! Bounded pool of OS worker threads with O(1) idle-worker lookup.
//!
//! A [`WorkerPool`] is a cheap handle onto a single control task that owns
//! all bookkeeping: the FIFO task queue, the [`IdleBitmap`], the worker
//! records and the in-flight map. Workers are dedicated threads fed through
//! per-worker channels; they report back to the control task over its
//! command channel, so no lock guards the scheduling state.
//!
//! Cancellation is cooperative. Cancelling or timing out a task settles the
//! caller's future and frees the logical slot, but a handler already running
//! on a worker thread runs to completion and its result is discarded. A
//! worker freed this way may be handed a new job, which then waits on that
//! thread until the abandoned handler returns.

pub mod bitmap;
pub mod handler;
pub mod runner;
pub mod stats;
pub mod task;
pub mod worker;

pub use bitmap::{BitmapFull, IdleBitmap, BITMAP_WIDTH};
pub use handler::{HandlerRegistry, TaskHandler};
pub use runner::WorkerPool;
pub use stats::PoolStats;
pub use task::{TaskId, TaskOptions, TaskState};
pub use worker::{WorkerId, WorkerSnapshot};
