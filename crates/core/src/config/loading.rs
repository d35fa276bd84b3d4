use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::error::ConfigError;

use super::types::EngineConfig;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Parse an env var, keeping the current value when it is absent or malformed.
fn env_parse<T: FromStr>(key: &str, current: &mut T) {
    if let Some(raw) = env_opt(key) {
        match raw.parse() {
            Ok(v) => *current = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable env override"),
        }
    }
}

impl EngineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Build config from defaults plus environment overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `SLUICE_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `SLUICE_POOL_MAX_WORKERS` -> `pool.max_workers`
    /// - `SLUICE_BATCH_BATCH_SIZE` -> `batch.batch_size`
    /// - `SLUICE_PRESSURE_CRITICAL_PCT` -> `pressure.critical_pct`
    pub(crate) fn apply_env_overrides(&mut self) {
        let pool = &mut self.pool;
        env_parse("SLUICE_POOL_MIN_WORKERS", &mut pool.min_workers);
        env_parse("SLUICE_POOL_MAX_WORKERS", &mut pool.max_workers);
        env_parse("SLUICE_POOL_IDLE_TIMEOUT_MS", &mut pool.idle_timeout_ms);
        env_parse("SLUICE_POOL_EVICTION_INTERVAL_MS", &mut pool.eviction_interval_ms);
        env_parse("SLUICE_POOL_TASK_TIMEOUT_MS", &mut pool.task_timeout_ms);

        let batch = &mut self.batch;
        env_parse("SLUICE_BATCH_BATCH_SIZE", &mut batch.batch_size);
        env_parse("SLUICE_BATCH_MAX_CONCURRENCY", &mut batch.max_concurrency);
        env_parse("SLUICE_BATCH_INTER_BATCH_DELAY_MS", &mut batch.inter_batch_delay_ms);
        env_parse("SLUICE_BATCH_PRESSURE_CHECKS", &mut batch.pressure_checks);
        env_parse("SLUICE_BATCH_PRESSURE_PAUSE_MS", &mut batch.pressure_pause_ms);

        let pressure = &mut self.pressure;
        env_parse("SLUICE_PRESSURE_MEDIUM_PCT", &mut pressure.medium_pct);
        env_parse("SLUICE_PRESSURE_HIGH_PCT", &mut pressure.high_pct);
        env_parse("SLUICE_PRESSURE_CRITICAL_PCT", &mut pressure.critical_pct);
        if let Some(raw) = env_opt("SLUICE_PRESSURE_HEAP_LIMIT_MB") {
            match raw.parse() {
                Ok(mb) => pressure.heap_limit_mb = Some(mb),
                Err(_) => tracing::warn!(value = %raw, "ignoring unparsable SLUICE_PRESSURE_HEAP_LIMIT_MB"),
            }
        }
        env_parse("SLUICE_PRESSURE_MAX_GC_ATTEMPTS", &mut pressure.max_gc_attempts);
        env_parse("SLUICE_PRESSURE_GC_RETRY_WAIT_MS", &mut pressure.gc_retry_wait_ms);
        env_parse("SLUICE_PRESSURE_CRITICAL_PAUSE_MS", &mut pressure.critical_pause_ms);
        env_parse("SLUICE_PRESSURE_MONITOR_INTERVAL_MS", &mut pressure.monitor_interval_ms);
        env_parse("SLUICE_PRESSURE_HISTORY_CAPACITY", &mut pressure.history_capacity);
    }
}
