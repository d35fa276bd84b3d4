use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::error::PressureError;

/// Raw memory counters, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryReading {
    pub rss_bytes: u64,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
}

/// Source of memory counters for the pressure monitor.
pub trait MemoryProbe: Send + Sync + 'static {
    fn read(&self) -> Result<MemoryReading, PressureError>;
}

/// Reads this process's RSS and system memory through `sysinfo`.
pub struct SysinfoProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::new().with_ram())
                .with_processes(ProcessRefreshKind::new().with_memory()),
        );
        Self {
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(system),
        }
    }

    /// Total physical memory, used to size batches.
    pub fn total_memory(&self) -> u64 {
        match self.system.lock() {
            Ok(system) => system.total_memory(),
            Err(poisoned) => poisoned.into_inner().total_memory(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn read(&self) -> Result<MemoryReading, PressureError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| PressureError::Probe("sysinfo state poisoned".into()))?;
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let rss_bytes = system
            .process(self.pid)
            .map(|p| p.memory())
            .ok_or_else(|| PressureError::Probe(format!("process {} not found", self.pid)))?;

        Ok(MemoryReading {
            rss_bytes,
            system_used_bytes: system.used_memory(),
            system_total_bytes: system.total_memory(),
        })
    }
}
