use super::types::{EngineConfig, PoolConfig, PressureConfig, MAX_POOL_WORKERS};
use crate::error::ConfigError;

#[test]
fn defaults_are_valid() {
    let cfg = EngineConfig::default();
    cfg.validate().unwrap();
    assert_eq!(cfg.pool.min_workers, 1);
    assert_eq!(cfg.batch.max_concurrency, 1);
    assert_eq!(cfg.pressure.medium_pct, 75.0);
    assert_eq!(cfg.pressure.high_pct, 80.0);
    assert_eq!(cfg.pressure.critical_pct, 85.0);
    assert_eq!(cfg.pressure.max_gc_attempts, 3);
    assert_eq!(cfg.pressure.history_capacity, 100);
}

#[test]
fn parse_empty_toml_uses_defaults() {
    let cfg = EngineConfig::from_toml("").unwrap();
    assert_eq!(cfg.pool.task_timeout_ms, 30_000);
    assert_eq!(cfg.batch.batch_size, 0);
    assert!(cfg.pressure.heap_limit_mb.is_none());
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[pool]
min_workers = 2
max_workers = 8
idle_timeout_ms = 5000
task_timeout_ms = 250

[batch]
batch_size = 100
max_concurrency = 4
pressure_checks = false

[pressure]
medium_pct = 60.0
high_pct = 70.0
critical_pct = 90.0
heap_limit_mb = 512
max_gc_attempts = 5
"#;
    let cfg = EngineConfig::from_toml(toml).unwrap();
    assert_eq!(cfg.pool.min_workers, 2);
    assert_eq!(cfg.pool.resolved_max_workers(), 8);
    assert_eq!(cfg.pool.eviction_interval_ms, 10_000); // default
    assert_eq!(cfg.batch.batch_size, 100);
    assert!(!cfg.batch.pressure_checks);
    assert_eq!(cfg.pressure.heap_limit_bytes(), Some(512 * 1024 * 1024));
    assert_eq!(cfg.pressure.max_gc_attempts, 5);
}

#[test]
fn rejects_pool_wider_than_bitmap() {
    let pool = PoolConfig {
        max_workers: MAX_POOL_WORKERS + 1,
        ..PoolConfig::default()
    };
    let err = pool.validate().unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("max_workers")));
}

#[test]
fn rejects_min_above_max() {
    let pool = PoolConfig {
        min_workers: 5,
        max_workers: 2,
        ..PoolConfig::default()
    };
    assert!(pool.validate().is_err());
}

#[test]
fn auto_max_workers_is_clamped() {
    let pool = PoolConfig::default();
    let resolved = pool.resolved_max_workers();
    assert!(resolved >= 1 && resolved <= MAX_POOL_WORKERS);
}

#[test]
fn rejects_non_ascending_thresholds() {
    let pressure = PressureConfig {
        medium_pct: 80.0,
        high_pct: 80.0,
        ..PressureConfig::default()
    };
    assert!(pressure.validate().is_err());

    let pressure = PressureConfig {
        critical_pct: 120.0,
        ..PressureConfig::default()
    };
    assert!(pressure.validate().is_err());
}

#[test]
fn rejects_zero_concurrency() {
    let toml = r#"
[batch]
max_concurrency = 0
"#;
    assert!(matches!(EngineConfig::from_toml(toml), Err(ConfigError::Invalid(_))));
}

#[test]
fn malformed_toml_is_parse_error() {
    assert!(matches!(EngineConfig::from_toml("[pool\nmin = "), Err(ConfigError::Parse(_))));
}

#[test]
fn missing_file_is_io_error() {
    let err = EngineConfig::from_file("/nonexistent/sluice.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
