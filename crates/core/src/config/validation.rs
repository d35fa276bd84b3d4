use crate::error::ConfigError;

use super::types::{BatchConfig, EngineConfig, PoolConfig, PressureConfig, MAX_POOL_WORKERS};

impl EngineConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.batch.validate()?;
        self.pressure.validate()?;
        Ok(())
    }
}

impl PoolConfig {
    /// Reject sizes the idle bitmap cannot represent and inverted bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.resolved_max_workers();
        if max == 0 || max > MAX_POOL_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "pool.max_workers must be between 1 and {MAX_POOL_WORKERS}, got {max}"
            )));
        }
        if self.min_workers > max {
            return Err(ConfigError::Invalid(format!(
                "pool.min_workers ({}) exceeds pool.max_workers ({max})",
                self.min_workers
            )));
        }
        if self.idle_timeout_ms == 0 || self.eviction_interval_ms == 0 || self.task_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pool timeouts and eviction interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("batch.max_concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

impl PressureConfig {
    /// Thresholds must be strictly ascending and within (0, 100].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("medium_pct", self.medium_pct),
            ("high_pct", self.high_pct),
            ("critical_pct", self.critical_pct),
        ];
        for (name, value) in thresholds {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "pressure.{name} must be within (0, 100], got {value}"
                )));
            }
        }
        if !(self.medium_pct < self.high_pct && self.high_pct < self.critical_pct) {
            return Err(ConfigError::Invalid(format!(
                "pressure thresholds must ascend: medium {} < high {} < critical {}",
                self.medium_pct, self.high_pct, self.critical_pct
            )));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("pressure.history_capacity must be at least 1".into()));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid("pressure.monitor_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}
