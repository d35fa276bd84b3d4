use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use sluice_compute::{HandlerRegistry, PoolError};

pub const CHECKSUM: &str = "checksum";
pub const SLEEP: &str = "sleep";

/// Task handlers available to `sluice run`.
pub fn registry() -> Result<HandlerRegistry, PoolError> {
    HandlerRegistry::new()
        .with(CHECKSUM, checksum)?
        .with(SLEEP, sleep)
}

/// Payload a run item is turned into for `task`.
pub fn payload(task: &str, item: usize, work: u64) -> Value {
    match task {
        SLEEP => json!({ "ms": work }),
        _ => json!({ "seed": item, "bytes": work }),
    }
}

/// SHA-256 over `bytes` pseudo-random bytes derived from `seed`.
fn checksum(payload: Value) -> Result<Value> {
    let seed = payload["seed"].as_u64().context("checksum payload needs a numeric seed")?;
    let len = payload["bytes"].as_u64().context("checksum payload needs a byte count")?;

    let mut hasher = Sha256::new();
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut chunk = [0u8; 8];
    let mut remaining = len;
    while remaining > 0 {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        chunk.copy_from_slice(&state.to_le_bytes());
        let take = remaining.min(8) as usize;
        hasher.update(&chunk[..take]);
        remaining -= take as u64;
    }

    Ok(json!({ "seed": seed, "sha256": format!("{:x}", hasher.finalize()) }))
}

fn sleep(payload: Value) -> Result<Value> {
    let ms = payload["ms"].as_u64().context("sleep payload needs a millisecond count")?;
    std::thread::sleep(Duration::from_millis(ms));
    Ok(json!({ "slept_ms": ms }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_both_handlers() {
        let registry = registry().unwrap();
        assert_eq!(registry.task_types(), vec!["checksum", "sleep"]);
    }

    #[test]
    fn checksum_is_deterministic_per_seed() {
        let a = checksum(payload(CHECKSUM, 7, 1000)).unwrap();
        let b = checksum(payload(CHECKSUM, 7, 1000)).unwrap();
        let c = checksum(payload(CHECKSUM, 8, 1000)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a["sha256"], c["sha256"]);
        assert_eq!(a["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn checksum_rejects_bad_payload() {
        let err = checksum(json!({ "bytes": 10 })).unwrap_err();
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn sleep_reports_duration() {
        assert_eq!(sleep(payload(SLEEP, 0, 1)).unwrap(), json!({ "slept_ms": 1 }));
    }
}
