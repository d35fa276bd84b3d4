use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use sluice_core::EngineConfig;

use crate::cli::RunArgs;

/// Return the default config file path: ~/.config/sluice/config.toml
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sluice").join("config.toml"))
}

/// Load the engine config from `path`, else the default path if it exists,
/// else defaults. `SLUICE_*` environment overrides apply in every case.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    match path {
        Some(path) => {
            debug!(config_path = %path.display(), "Loading config");
            EngineConfig::from_file(&path)
                .with_context(|| format!("failed to load config: {}", path.display()))
        }
        None => {
            debug!("No config file, using defaults and environment");
            EngineConfig::from_env().context("invalid configuration from environment")
        }
    }
}

/// Apply `run` flags on top of the loaded config and revalidate.
pub fn apply_run_overrides(mut config: EngineConfig, args: &RunArgs) -> Result<EngineConfig> {
    if let Some(size) = args.batch_size {
        config.batch.batch_size = size;
    }
    if let Some(concurrency) = args.concurrency {
        config.batch.max_concurrency = concurrency;
    }
    if let Some(workers) = args.workers {
        config.pool.max_workers = workers;
        config.pool.min_workers = config.pool.min_workers.min(workers.max(1));
    }
    if let Some(timeout) = args.timeout_ms {
        config.pool.task_timeout_ms = timeout;
    }
    config.validate().context("invalid command-line overrides")?;
    Ok(config)
}
