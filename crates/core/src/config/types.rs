use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Width of the pool's idle bitmap. A pool can never hold more workers than this.
pub const MAX_POOL_WORKERS: usize = 32;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for the execution engine.
///
/// Parsed from `sluice.toml` with support for `SLUICE_*` environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool sizing and timeouts.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Batch scheduler behaviour.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Memory pressure thresholds and GC policy.
    #[serde(default)]
    pub pressure: PressureConfig,
}

impl EngineConfig {
    /// Print a one-line summary per section for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Engine config loaded:");
        tracing::info!(
            "  pool:      workers={}..={}, task_timeout={}ms, idle_timeout={}ms",
            self.pool.min_workers,
            self.pool.resolved_max_workers(),
            self.pool.task_timeout_ms,
            self.pool.idle_timeout_ms
        );
        tracing::info!(
            "  batch:     batch_size={}, max_concurrency={}, pressure_checks={}",
            if self.batch.batch_size == 0 { "adaptive".to_string() } else { self.batch.batch_size.to_string() },
            self.batch.max_concurrency,
            self.batch.pressure_checks
        );
        tracing::info!(
            "  pressure:  medium={}%, high={}%, critical={}%, max_gc_attempts={}",
            self.pressure.medium_pct,
            self.pressure.high_pct,
            self.pressure.critical_pct,
            self.pressure.max_gc_attempts
        );
    }
}

// ── Pool ────────────────────────────────────────────────────────────

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Workers kept alive even when idle.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound on workers. 0 = available parallelism (capped at the bitmap width).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Idle time after which workers beyond `min_workers` are evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// How often the pool looks for idle workers to evict.
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_ms: u64,
    /// Per-task deadline used when the caller does not pass one.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,
}

fn default_min_workers() -> usize { 1 }
fn default_max_workers() -> usize { 0 }
fn default_idle_timeout() -> u64 { 60_000 }
fn default_eviction_interval() -> u64 { 10_000 }
fn default_task_timeout() -> u64 { 30_000 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            idle_timeout_ms: default_idle_timeout(),
            eviction_interval_ms: default_eviction_interval(),
            task_timeout_ms: default_task_timeout(),
        }
    }
}

impl PoolConfig {
    /// Resolve the worker ceiling (0 means use available parallelism).
    ///
    /// Auto-detection is clamped to [`MAX_POOL_WORKERS`]; an explicit value is
    /// returned as-is so that validation can reject it loudly.
    pub fn resolved_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(MAX_POOL_WORKERS)
        } else {
            self.max_workers
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

// ── Batch ───────────────────────────────────────────────────────────

/// Batch scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per batch. 0 = derive from total system memory.
    #[serde(default)]
    pub batch_size: usize,
    /// Batches allowed in flight at once. 1 = strictly sequential.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Delay inserted between batches.
    #[serde(default)]
    pub inter_batch_delay_ms: u64,
    /// Sample memory pressure before every batch.
    #[serde(default = "default_pressure_checks")]
    pub pressure_checks: bool,
    /// Pause applied when pressure stays high after GC attempts.
    #[serde(default = "default_pressure_pause")]
    pub pressure_pause_ms: u64,
}

fn default_max_concurrency() -> usize { 1 }
fn default_pressure_checks() -> bool { true }
fn default_pressure_pause() -> u64 { 1_000 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 0,
            max_concurrency: default_max_concurrency(),
            inter_batch_delay_ms: 0,
            pressure_checks: default_pressure_checks(),
            pressure_pause_ms: default_pressure_pause(),
        }
    }
}

impl BatchConfig {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn pressure_pause(&self) -> Duration {
        Duration::from_millis(self.pressure_pause_ms)
    }
}

// ── Pressure ────────────────────────────────────────────────────────

/// Memory pressure monitor configuration.
///
/// Levels: low below `medium_pct`, medium below `high_pct`, high below
/// `critical_pct`, critical at or above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureConfig {
    #[serde(default = "default_medium_pct")]
    pub medium_pct: f64,
    #[serde(default = "default_high_pct")]
    pub high_pct: f64,
    #[serde(default = "default_critical_pct")]
    pub critical_pct: f64,
    /// Process memory budget. When unset only system memory is considered.
    #[serde(default)]
    pub heap_limit_mb: Option<u64>,
    /// GC attempts per relief cycle before giving up.
    #[serde(default = "default_max_gc_attempts")]
    pub max_gc_attempts: u32,
    /// Wait between GC attempts before resampling.
    #[serde(default = "default_gc_retry_wait")]
    pub gc_retry_wait_ms: u64,
    /// Extra pause when the level is critical.
    #[serde(default = "default_critical_pause")]
    pub critical_pause_ms: u64,
    /// Sampling interval for background monitoring.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// GC outcomes retained for effectiveness analysis.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_medium_pct() -> f64 { 75.0 }
fn default_high_pct() -> f64 { 80.0 }
fn default_critical_pct() -> f64 { 85.0 }
fn default_max_gc_attempts() -> u32 { 3 }
fn default_gc_retry_wait() -> u64 { 100 }
fn default_critical_pause() -> u64 { 2_000 }
fn default_monitor_interval() -> u64 { 5_000 }
fn default_history_capacity() -> usize { 100 }

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            medium_pct: default_medium_pct(),
            high_pct: default_high_pct(),
            critical_pct: default_critical_pct(),
            heap_limit_mb: None,
            max_gc_attempts: default_max_gc_attempts(),
            gc_retry_wait_ms: default_gc_retry_wait(),
            critical_pause_ms: default_critical_pause(),
            monitor_interval_ms: default_monitor_interval(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl PressureConfig {
    pub fn heap_limit_bytes(&self) -> Option<u64> {
        self.heap_limit_mb.map(|mb| mb * 1024 * 1024)
    }

    pub fn gc_retry_wait(&self) -> Duration {
        Duration::from_millis(self.gc_retry_wait_ms)
    }

    pub fn critical_pause(&self) -> Duration {
        Duration::from_millis(self.critical_pause_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
