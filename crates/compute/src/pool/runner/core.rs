use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use sluice_core::{ConfigError, PoolConfig};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::info;

use crate::error::PoolError;
use crate::pool::handler::HandlerRegistry;
use crate::pool::stats::PoolStats;

use super::control::PoolControl;
use super::Command;

/// Handle to a worker pool. Clones share the same pool.
///
/// Must be created inside a Tokio runtime; the control task and all task
/// timers run on it. Dropping the last handle tears the pool down exactly
/// like [`WorkerPool::destroy`].
#[derive(Clone)]
pub struct WorkerPool {
    pub(super) shared: Arc<PoolShared>,
}

pub(super) struct PoolShared {
    pub(super) config: PoolConfig,
    pub(super) registry: Arc<HandlerRegistry>,
    pub(super) commands: UnboundedSender<Command>,
    /// Published by the control task before any caller is settled.
    pub(super) stats: Arc<RwLock<PoolStats>>,
    pub(super) destroyed: AtomicBool,
    pub(super) next_task_id: AtomicU64,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Destroy(None));
        }
    }
}

impl WorkerPool {
    /// Create a pool and start its `min_workers` threads.
    pub fn new(config: PoolConfig, registry: HandlerRegistry) -> Result<Self, PoolError> {
        config.validate()?;
        if registry.is_empty() {
            return Err(ConfigError::Invalid("worker pool needs at least one task handler".into()).into());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PoolError::Spawn(format!("worker pool requires a tokio runtime: {e}")))?;

        let registry = Arc::new(registry);
        let stats = Arc::new(RwLock::new(PoolStats::default()));
        let (commands, inbox) = mpsc::unbounded_channel();

        let mut control = PoolControl::new(
            config.clone(),
            Arc::clone(&registry),
            commands.clone(),
            Arc::clone(&stats),
        );
        control.replenish()?;
        control.publish();

        info!(
            "Worker pool started: {} workers (max {}), task types: {:?}",
            config.min_workers,
            config.resolved_max_workers(),
            registry.task_types()
        );
        runtime.spawn(control.run(inbox));

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                registry,
                commands,
                stats,
                destroyed: AtomicBool::new(false),
                next_task_id: AtomicU64::new(1),
            }),
        })
    }

    /// Snapshot of worker counts, queue depth, and task counters.
    pub fn stats(&self) -> PoolStats {
        match self.shared.stats.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Task types this pool accepts.
    pub fn task_types(&self) -> Vec<String> {
        self.shared.registry.task_types()
    }
}
