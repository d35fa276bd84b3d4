use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use sluice_core::{ConfigError, PressureConfig};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PressureError;

use super::gc::{default_gc_hook, GcHook};
use super::probe::{MemoryProbe, SysinfoProbe};
use super::types::{
    EffectivenessReport, GcOutcome, GcRating, GcStatus, PressureLevel, PressureSample,
    ReliefOutcome, MB,
};

/// Minimum available outcomes before low reclaim is reported as a leak.
const LEAK_MIN_SAMPLES: usize = 5;
const LEAK_MAX_AVG_FREED_MB: f64 = 1.0;

/// Samples memory, classifies pressure, and drives manual GC.
///
/// Cheap to clone; clones share history and the monitoring timer.
#[derive(Clone)]
pub struct PressureMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: PressureConfig,
    probe: Arc<dyn MemoryProbe>,
    gc_hook: Option<Arc<dyn GcHook>>,
    history: Mutex<VecDeque<GcOutcome>>,
    last_sample: Mutex<Option<PressureSample>>,
    monitoring: Mutex<Option<CancellationToken>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.monitoring).take() {
            token.cancel();
        }
    }
}

/// Sleep for `duration` unless `token` fires first. Returns false when
/// cancelled.
pub(crate) async fn pause(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PressureMonitor {
    /// Monitor backed by `sysinfo` and the platform's default GC hook.
    pub fn new(config: PressureConfig) -> Result<Self, PressureError> {
        Self::with_parts(config, Arc::new(SysinfoProbe::new()), default_gc_hook())
    }

    pub fn with_parts(
        config: PressureConfig,
        probe: Arc<dyn MemoryProbe>,
        gc_hook: Option<Arc<dyn GcHook>>,
    ) -> Result<Self, PressureError> {
        config.validate()?;
        let capacity = config.history_capacity;
        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                gc_hook,
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                last_sample: Mutex::new(None),
                monitoring: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &PressureConfig {
        &self.inner.config
    }

    pub fn gc_available(&self) -> bool {
        self.inner.gc_hook.is_some()
    }

    /// Read memory counters and classify them.
    pub fn sample(&self) -> Result<PressureSample, PressureError> {
        let reading = self.inner.probe.read()?;
        let sample = PressureSample::from_reading(reading, &self.inner.config);
        *lock(&self.inner.last_sample) = Some(sample.clone());
        Ok(sample)
    }

    /// Most recent sample taken by any caller or the monitoring timer.
    pub fn last_sample(&self) -> Option<PressureSample> {
        lock(&self.inner.last_sample).clone()
    }

    /// Run the GC hook once and record before/after RSS.
    ///
    /// Without a hook this records a [`GcStatus::Unavailable`] outcome.
    pub fn trigger_gc(&self, reason: &str) -> Result<GcOutcome, PressureError> {
        let triggered_at = Utc::now();
        let started = Instant::now();
        let before_bytes = self.inner.probe.read()?.rss_bytes;

        let (status, after_bytes) = match &self.inner.gc_hook {
            Some(hook) => {
                if let Err(e) = hook.collect() {
                    warn!(hook = hook.name(), error = %e, "GC hook returned an error");
                }
                (GcStatus::Completed, self.inner.probe.read()?.rss_bytes)
            }
            None => (GcStatus::Unavailable, before_bytes),
        };

        let outcome = GcOutcome {
            status,
            reason: reason.to_string(),
            triggered_at,
            before_bytes,
            after_bytes,
            freed_bytes: before_bytes.saturating_sub(after_bytes),
            duration: started.elapsed(),
        };
        match status {
            GcStatus::Completed => info!(
                reason,
                freed_mb = outcome.freed_mb(),
                duration = ?outcome.duration,
                "GC triggered"
            ),
            GcStatus::Unavailable => debug!(reason, "no GC hook available"),
        }

        let mut history = lock(&self.inner.history);
        while history.len() >= self.inner.config.history_capacity {
            history.pop_front();
        }
        history.push_back(outcome.clone());
        Ok(outcome)
    }

    /// Bounded GC loop: at most `max_gc_attempts` triggers with
    /// `gc_retry_wait` between them, plus `critical_pause` if pressure is
    /// still critical afterwards.
    pub async fn relieve_pressure(&self) -> Result<ReliefOutcome, PressureError> {
        self.relieve_pressure_until(&CancellationToken::new()).await
    }

    /// [`relieve_pressure`](Self::relieve_pressure) that stops waiting as
    /// soon as `token` is cancelled. An interrupted run returns the latest
    /// sample without the critical pause.
    pub async fn relieve_pressure_until(
        &self,
        token: &CancellationToken,
    ) -> Result<ReliefOutcome, PressureError> {
        let config = &self.inner.config;
        let mut sample = self.sample()?;
        let mut attempts = 0;

        while sample.level.requires_gc() && attempts < config.max_gc_attempts {
            attempts += 1;
            let reason = format!("{} pressure at {:.1}%", sample.level, sample.pct);
            let outcome = self.trigger_gc(&reason)?;
            if outcome.status == GcStatus::Unavailable {
                break;
            }
            if !pause(config.gc_retry_wait(), token).await {
                return Ok(ReliefOutcome { attempts, sample, paused: false });
            }
            sample = self.sample()?;
        }

        let mut paused = false;
        if sample.level == PressureLevel::Critical {
            warn!(
                pct = sample.pct,
                pause = ?config.critical_pause(),
                "Memory pressure still critical after {} GC attempts, pausing",
                attempts
            );
            if !pause(config.critical_pause(), token).await {
                return Ok(ReliefOutcome { attempts, sample, paused: false });
            }
            paused = true;
            sample = self.sample()?;
        }

        Ok(ReliefOutcome { attempts, sample, paused })
    }

    /// Sample on a timer, relieving pressure whenever the level calls for
    /// GC. Replaces any timer already running. The timer holds only a weak
    /// reference, so it stops once every handle is dropped.
    pub fn start_monitoring(&self, interval: Duration) -> Result<(), PressureError> {
        if interval.is_zero() {
            return Err(ConfigError::Invalid("monitor interval must be non-zero".into()).into());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PressureError::Runtime(e.to_string()))?;

        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.monitoring).replace(token.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PressureMonitor { inner }.check(&token).await;
            }
            debug!("pressure monitoring stopped");
        });

        info!(?interval, "Pressure monitoring started");
        Ok(())
    }

    /// Returns false if no timer was running.
    pub fn stop_monitoring(&self) -> bool {
        match lock(&self.inner.monitoring).take() {
            Some(token) => {
                token.cancel();
                info!("Pressure monitoring stop requested");
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.inner.monitoring)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    async fn check(&self, token: &CancellationToken) {
        let sample = match self.sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "pressure sample failed");
                return;
            }
        };
        if !sample.level.requires_gc() {
            debug!(level = %sample.level, pct = sample.pct, "pressure check");
            return;
        }

        tokio::select! {
            _ = token.cancelled() => {}
            relief = self.relieve_pressure_until(token) => match relief {
                Ok(relief) if relief.relieved() => {
                    info!(attempts = relief.attempts, level = %relief.sample.level, "memory pressure relieved");
                }
                Ok(relief) => {
                    warn!(
                        attempts = relief.attempts,
                        level = %relief.sample.level,
                        "memory pressure persists after GC, giving up until next check"
                    );
                }
                Err(e) => warn!(error = %e, "pressure relief failed"),
            },
        }
    }

    /// Oldest first.
    pub fn gc_history(&self) -> Vec<GcOutcome> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Rate how much memory GC has been reclaiming.
    pub fn analyze_effectiveness(&self) -> EffectivenessReport {
        let history = lock(&self.inner.history);
        let completed: Vec<&GcOutcome> = history
            .iter()
            .filter(|o| o.status == GcStatus::Completed)
            .collect();
        let unavailable = history.len() - completed.len();

        if completed.is_empty() {
            let recommendation = if unavailable > 0 {
                "no manual GC hook on this platform; reduce batch size or concurrency instead"
            } else {
                GcRating::InsufficientData.recommendation()
            };
            return EffectivenessReport {
                samples: 0,
                unavailable,
                avg_freed_mb: 0.0,
                avg_duration: Duration::ZERO,
                rating: GcRating::InsufficientData,
                suspected_leak: false,
                recommendation: recommendation.to_string(),
            };
        }

        let n = completed.len();
        let freed: u64 = completed.iter().map(|o| o.freed_bytes).sum();
        let total_duration: Duration = completed.iter().map(|o| o.duration).sum();
        let avg_freed_mb = freed as f64 / n as f64 / MB;
        let rating = GcRating::from_avg_freed_mb(avg_freed_mb);
        let suspected_leak = n >= LEAK_MIN_SAMPLES && avg_freed_mb < LEAK_MAX_AVG_FREED_MB;

        let recommendation = if suspected_leak {
            format!(
                "{}; {} GC runs averaged {:.2} MB freed, probable memory leak",
                rating.recommendation(),
                n,
                avg_freed_mb
            )
        } else {
            rating.recommendation().to_string()
        };

        EffectivenessReport {
            samples: n,
            unavailable,
            avg_freed_mb,
            avg_duration: total_duration / n as u32,
            rating,
            suspected_leak,
            recommendation,
        }
    }
}

impl std::fmt::Debug for PressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureMonitor")
            .field("config", &self.inner.config)
            .field("gc_hook", &self.inner.gc_hook.as_ref().map(|h| h.name().to_string()))
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pressure::gc::FnGcHook;
    use crate::pressure::probe::MemoryReading;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Replays readings in order, repeating the last one.
    struct ScriptedProbe {
        readings: Vec<MemoryReading>,
        next: AtomicUsize,
    }

    impl ScriptedProbe {
        fn system_pcts(pcts: &[u64]) -> Arc<Self> {
            Self::new(
                pcts.iter()
                    .map(|pct| MemoryReading {
                        rss_bytes: 100 * 1024 * 1024,
                        system_used_bytes: pct * GIB / 100,
                        system_total_bytes: GIB,
                    })
                    .collect(),
            )
        }

        fn new(readings: Vec<MemoryReading>) -> Arc<Self> {
            Arc::new(Self { readings, next: AtomicUsize::new(0) })
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn read(&self) -> Result<MemoryReading, PressureError> {
            let i = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(self.readings[i.min(self.readings.len() - 1)])
        }
    }

    fn counting_hook() -> (Arc<AtomicUsize>, Arc<dyn GcHook>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook = FnGcHook::new("counting", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (calls, Arc::new(hook))
    }

    fn fast_config() -> PressureConfig {
        PressureConfig {
            gc_retry_wait_ms: 1,
            critical_pause_ms: 1,
            ..PressureConfig::default()
        }
    }

    #[test]
    fn sample_records_last_sample() {
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[50, 82]), None)
                .unwrap();
        assert!(monitor.last_sample().is_none());
        assert_eq!(monitor.sample().unwrap().level, PressureLevel::Low);
        assert_eq!(monitor.sample().unwrap().level, PressureLevel::High);
        assert_eq!(monitor.last_sample().unwrap().level, PressureLevel::High);
    }

    #[test]
    fn invalid_config_rejected() {
        let config = PressureConfig {
            high_pct: 90.0,
            critical_pct: 85.0,
            ..PressureConfig::default()
        };
        let err = PressureMonitor::with_parts(config, ScriptedProbe::system_pcts(&[10]), None).unwrap_err();
        assert!(matches!(err, PressureError::Config(_)));
    }

    #[test]
    fn trigger_gc_without_hook_is_unavailable() {
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[90]), None).unwrap();
        let outcome = monitor.trigger_gc("manual").unwrap();
        assert_eq!(outcome.status, GcStatus::Unavailable);
        assert_eq!(outcome.freed_bytes, 0);
        assert_eq!(monitor.gc_history().len(), 1);
    }

    #[test]
    fn trigger_gc_measures_freed_bytes() {
        let probe = ScriptedProbe::new(vec![
            MemoryReading { rss_bytes: 300 * 1024 * 1024, system_used_bytes: 1, system_total_bytes: 10 },
            MemoryReading { rss_bytes: 240 * 1024 * 1024, system_used_bytes: 1, system_total_bytes: 10 },
        ]);
        let (calls, hook) = counting_hook();
        let monitor = PressureMonitor::with_parts(fast_config(), probe, Some(hook)).unwrap();

        let outcome = monitor.trigger_gc("test").unwrap();
        assert_eq!(outcome.status, GcStatus::Completed);
        assert_eq!(outcome.freed_bytes, 60 * 1024 * 1024);
        assert!((outcome.freed_mb() - 60.0).abs() < 1e-9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_is_bounded() {
        let config = PressureConfig {
            history_capacity: 3,
            ..fast_config()
        };
        let monitor = PressureMonitor::with_parts(config, ScriptedProbe::system_pcts(&[10]), None).unwrap();
        for i in 0..5 {
            monitor.trigger_gc(&format!("run {i}")).unwrap();
        }
        let history = monitor.gc_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].reason, "run 2");
        assert_eq!(history[2].reason, "run 4");
    }

    #[tokio::test]
    async fn relief_stops_once_pressure_drops() {
        // initial 90, gc before/after, recheck 60
        let probe = ScriptedProbe::system_pcts(&[90, 90, 90, 60]);
        let (calls, hook) = counting_hook();
        let monitor = PressureMonitor::with_parts(fast_config(), probe, Some(hook)).unwrap();

        let relief = monitor.relieve_pressure().await.unwrap();
        assert_eq!(relief.attempts, 1);
        assert!(relief.relieved());
        assert!(!relief.paused);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relief_is_bounded_and_pauses_on_critical() {
        let (calls, hook) = counting_hook();
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[95]), Some(hook)).unwrap();

        let relief = monitor.relieve_pressure().await.unwrap();
        assert_eq!(relief.attempts, 3);
        assert!(relief.paused);
        assert!(!relief.relieved());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn relief_without_hook_gives_up_after_one_attempt() {
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[82]), None).unwrap();
        let relief = monitor.relieve_pressure().await.unwrap();
        assert_eq!(relief.attempts, 1);
        assert!(!relief.paused, "high is not critical");
        assert_eq!(monitor.analyze_effectiveness().unavailable, 1);
    }

    #[test]
    fn effectiveness_insufficient_without_history() {
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[10]), None).unwrap();
        let report = monitor.analyze_effectiveness();
        assert_eq!(report.rating, GcRating::InsufficientData);
        assert_eq!(report.samples, 0);
        assert!(!report.suspected_leak);
    }

    #[test]
    fn effectiveness_flags_leak_after_repeated_low_reclaim() {
        // Every trigger reads the same RSS before and after: nothing freed.
        let (_, hook) = counting_hook();
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[90]), Some(hook)).unwrap();
        for _ in 0..4 {
            monitor.trigger_gc("pressure").unwrap();
        }
        assert!(!monitor.analyze_effectiveness().suspected_leak);

        monitor.trigger_gc("pressure").unwrap();
        let report = monitor.analyze_effectiveness();
        assert_eq!(report.samples, 5);
        assert_eq!(report.rating, GcRating::VeryPoor);
        assert!(report.suspected_leak);
        assert!(report.recommendation.contains("leak"));
    }

    #[tokio::test]
    async fn start_monitoring_rejects_zero_interval() {
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[10]), None).unwrap();
        assert!(monitor.start_monitoring(Duration::ZERO).is_err());
        assert!(!monitor.is_monitoring());
    }

    #[test]
    fn start_monitoring_requires_runtime() {
        let monitor =
            PressureMonitor::with_parts(fast_config(), ScriptedProbe::system_pcts(&[10]), None).unwrap();
        let err = monitor.start_monitoring(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, PressureError::Runtime(_)));
    }
}
