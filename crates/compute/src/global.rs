//! Optional process-wide default pool and monitor.
//!
//! Prefer passing [`WorkerPool`] and [`PressureMonitor`] handles explicitly.
//! These accessors exist for callers that need one shared instance; each
//! holds at most one live value and can be re-created after shutdown.

use std::sync::{Mutex, MutexGuard};

use sluice_core::{PoolConfig, PressureConfig};
use tracing::info;

use crate::error::{PoolError, PressureError};
use crate::pool::{HandlerRegistry, WorkerPool};
use crate::pressure::PressureMonitor;

static DEFAULT_POOL: Mutex<Option<WorkerPool>> = Mutex::new(None);
static DEFAULT_MONITOR: Mutex<Option<PressureMonitor>> = Mutex::new(None);

fn lock<T>(mutex: &'static Mutex<T>) -> MutexGuard<'static, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Create the default pool. Fails with [`PoolError::AlreadyInstalled`] while
/// a live default exists; a destroyed one is replaced.
pub fn install_default_pool(
    config: PoolConfig,
    registry: HandlerRegistry,
) -> Result<WorkerPool, PoolError> {
    let mut slot = lock(&DEFAULT_POOL);
    if slot.as_ref().is_some_and(|pool| !pool.is_destroyed()) {
        return Err(PoolError::AlreadyInstalled);
    }
    let pool = WorkerPool::new(config, registry)?;
    *slot = Some(pool.clone());
    info!("Default worker pool installed");
    Ok(pool)
}

/// The live default pool, if any.
pub fn default_pool() -> Option<WorkerPool> {
    lock(&DEFAULT_POOL)
        .as_ref()
        .filter(|pool| !pool.is_destroyed())
        .cloned()
}

/// Destroy and clear the default pool. Returns false if none was installed.
pub async fn shutdown_default_pool() -> bool {
    let pool = lock(&DEFAULT_POOL).take();
    match pool {
        Some(pool) => {
            pool.destroy().await;
            true
        }
        None => false,
    }
}

/// The default monitor, created from [`PressureConfig::default`] on first use.
pub fn default_monitor() -> Result<PressureMonitor, PressureError> {
    let mut slot = lock(&DEFAULT_MONITOR);
    if let Some(monitor) = slot.as_ref() {
        return Ok(monitor.clone());
    }
    let monitor = PressureMonitor::new(PressureConfig::default())?;
    *slot = Some(monitor.clone());
    Ok(monitor)
}

/// Stop the default monitor's timer and clear it.
pub fn shutdown_default_monitor() -> bool {
    match lock(&DEFAULT_MONITOR).take() {
        Some(monitor) => {
            monitor.stop_monitoring();
            true
        }
        None => false,
    }
}
