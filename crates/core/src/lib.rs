pub mod config;
pub mod error;

pub use config::{load_dotenv, BatchConfig, EngineConfig, PoolConfig, PressureConfig, MAX_POOL_WORKERS};
pub use error::ConfigError;
