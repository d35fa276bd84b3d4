use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::PressureConfig;

use super::probe::MemoryReading;

pub(crate) const MB: f64 = 1024.0 * 1024.0;

/// Discrete memory pressure level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    /// High and critical pressure call for a GC attempt.
    pub fn requires_gc(self) -> bool {
        self >= PressureLevel::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller should do about the sampled pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedAction {
    None,
    Monitor,
    TriggerGc,
    PauseAndGc,
}

impl From<PressureLevel> for RecommendedAction {
    fn from(level: PressureLevel) -> Self {
        match level {
            PressureLevel::Low => RecommendedAction::None,
            PressureLevel::Medium => RecommendedAction::Monitor,
            PressureLevel::High => RecommendedAction::TriggerGc,
            PressureLevel::Critical => RecommendedAction::PauseAndGc,
        }
    }
}

/// Map a usage percentage to a level using the ascending thresholds.
pub fn classify(pct: f64, config: &PressureConfig) -> PressureLevel {
    if pct >= config.critical_pct {
        PressureLevel::Critical
    } else if pct >= config.high_pct {
        PressureLevel::High
    } else if pct >= config.medium_pct {
        PressureLevel::Medium
    } else {
        PressureLevel::Low
    }
}

/// Immutable memory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PressureSample {
    pub taken_at: DateTime<Utc>,
    /// Resident set size of this process.
    pub rss_bytes: u64,
    pub heap_limit_bytes: Option<u64>,
    /// RSS against `heap_limit_bytes`; absent without a configured limit.
    pub heap_pct: Option<f64>,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
    pub system_pct: f64,
    /// The larger of `heap_pct` and `system_pct`.
    pub pct: f64,
    pub level: PressureLevel,
    pub action: RecommendedAction,
}

impl PressureSample {
    pub fn from_reading(reading: MemoryReading, config: &PressureConfig) -> Self {
        let system_pct = percent(reading.system_used_bytes, reading.system_total_bytes);
        let heap_limit_bytes = config.heap_limit_bytes().filter(|limit| *limit > 0);
        let heap_pct = heap_limit_bytes.map(|limit| percent(reading.rss_bytes, limit));
        let pct = heap_pct.map_or(system_pct, |heap| heap.max(system_pct));
        let level = classify(pct, config);

        Self {
            taken_at: Utc::now(),
            rss_bytes: reading.rss_bytes,
            heap_limit_bytes,
            heap_pct,
            system_used_bytes: reading.system_used_bytes,
            system_total_bytes: reading.system_total_bytes,
            system_pct,
            pct,
            level,
            action: level.into(),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcStatus {
    Completed,
    /// No manual GC hook on this platform. Informational.
    Unavailable,
}

/// Record of one GC trigger, kept in the monitor's bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct GcOutcome {
    pub status: GcStatus,
    pub reason: String,
    pub triggered_at: DateTime<Utc>,
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub freed_bytes: u64,
    pub duration: Duration,
}

impl GcOutcome {
    pub fn freed_mb(&self) -> f64 {
        self.freed_bytes as f64 / MB
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcRating {
    Excellent,
    Good,
    Poor,
    VeryPoor,
    InsufficientData,
}

impl GcRating {
    pub fn from_avg_freed_mb(avg: f64) -> Self {
        if avg >= 50.0 {
            GcRating::Excellent
        } else if avg >= 10.0 {
            GcRating::Good
        } else if avg >= 1.0 {
            GcRating::Poor
        } else {
            GcRating::VeryPoor
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            GcRating::Excellent => "GC reclaims memory well; no action needed",
            GcRating::Good => "GC is effective; keep monitoring under sustained load",
            GcRating::Poor => "GC frees little memory; reduce batch size or concurrency",
            GcRating::VeryPoor => {
                "GC frees almost nothing; live data is growing, check for leaks or unbounded caches"
            }
            GcRating::InsufficientData => "not enough GC outcomes recorded to judge effectiveness",
        }
    }
}

/// Summary of GC history produced by `analyze_effectiveness`.
#[derive(Debug, Clone, Serialize)]
pub struct EffectivenessReport {
    /// Outcomes where a GC hook actually ran.
    pub samples: usize,
    pub unavailable: usize,
    pub avg_freed_mb: f64,
    pub avg_duration: Duration,
    pub rating: GcRating,
    /// Consistently low reclaim across repeated triggers.
    pub suspected_leak: bool,
    pub recommendation: String,
}

/// Result of the bounded GC loop.
#[derive(Debug, Clone, Serialize)]
pub struct ReliefOutcome {
    pub attempts: u32,
    /// Pressure after the last attempt (and pause, if any).
    pub sample: PressureSample,
    /// Whether the critical-level pause was taken.
    pub paused: bool,
}

impl ReliefOutcome {
    pub fn relieved(&self) -> bool {
        !self.sample.level.requires_gc()
    }
}
