//! Engine configuration: worker pool, batch scheduler, and pressure monitor.
//!
//! Split into focused submodules:
//! - `types`: section structs with serde defaults
//! - `loading`: TOML parsing, file loading, and `SLUICE_*` env overrides
//! - `validation`: cross-field checks run after every load

mod loading;
mod types;
mod validation;
#[cfg(test)]
mod tests;

pub use self::loading::load_dotenv;
pub use self::types::{BatchConfig, EngineConfig, PoolConfig, PressureConfig, MAX_POOL_WORKERS};
