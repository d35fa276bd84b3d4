//! Integration tests for the batch scheduler: partitioning, failure
//! collection, bounded concurrency, cancellation, observers, pressure
//! back-off and checkpoint resume.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sluice_compute::batch::{BatchScheduler, Checkpoint};
use sluice_compute::error::PressureError;
use sluice_compute::pool::{HandlerRegistry, TaskOptions, WorkerPool};
use sluice_compute::pressure::{FnGcHook, GcHook, MemoryProbe, MemoryReading, PressureLevel, PressureMonitor};
use sluice_core::{BatchConfig, PoolConfig, PressureConfig};

fn scheduler(batch_size: usize, max_concurrency: usize) -> BatchScheduler {
    let config = BatchConfig {
        batch_size,
        max_concurrency,
        ..BatchConfig::default()
    };
    BatchScheduler::new(config, None).unwrap()
}

fn items(n: u32) -> Vec<u32> {
    (1..=n).collect()
}

#[tokio::test]
async fn failing_middle_batch_keeps_the_others() {
    let scheduler = scheduler(100, 1);
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&sizes);

    let result = scheduler
        .process(
            items(250),
            move |batch: Vec<u32>, index, _token| {
                seen.lock().unwrap().push(batch.len());
                async move {
                    if index == 1 {
                        anyhow::bail!("batch two is poisoned");
                    }
                    Ok::<_, anyhow::Error>(batch.into_iter().map(|x| x * 2).collect::<Vec<u32>>())
                }
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(*sizes.lock().unwrap(), vec![100, 100, 50]);
    assert!(!result.success);
    assert!(!result.cancelled);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].index, 1);
    assert_eq!(result.errors[0].items, 100..200);
    assert!(result.errors[0].message.contains("poisoned"));

    let indices: Vec<usize> = result.results.iter().map(|b| b.index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(result.results[0].results[0], 2);
    assert_eq!(result.results[1].results.len(), 50);

    assert_eq!(result.progress.total_batches, 3);
    assert_eq!(result.progress.completed_batches, 2);
    assert_eq!(result.progress.failed_batches, 1);
    assert_eq!(result.progress.processed_items, 250);
    assert!((result.progress.percent - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn panicking_batch_is_captured() {
    let result = scheduler(10, 1)
        .process(
            items(30),
            |batch: Vec<u32>, index, _token| async move {
                if index == 2 {
                    panic!("index out of range");
                }
                Ok::<_, anyhow::Error>(batch)
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.results.len(), 2);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].message.contains("panicked"));
    assert!(result.errors[0].message.contains("index out of range"));
}

#[tokio::test]
async fn sequential_mode_runs_in_input_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let result = scheduler(3, 1)
        .process(
            items(20),
            move |batch: Vec<u32>, index, _token| {
                let seen = Arc::clone(&seen);
                async move {
                    // Later batches finish faster; order must still hold.
                    tokio::time::sleep(Duration::from_millis(10 - index as u64)).await;
                    seen.lock().unwrap().push(index);
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success);
    assert_eq!(*order.lock().unwrap(), (0..7).collect::<Vec<_>>());
    assert_eq!(result.into_flat_results(), items(20));
}

#[tokio::test]
async fn concurrency_is_bounded_and_results_stay_ordered() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (live, max) = (Arc::clone(&in_flight), Arc::clone(&peak));

    let result = scheduler(5, 3)
        .process(
            items(50),
            move |batch: Vec<u32>, index, _token| {
                let (live, max) = (Arc::clone(&live), Arc::clone(&max));
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5 + (index % 3) as u64 * 5)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak}");
    assert!(peak >= 2, "batches never overlapped");
    let indices: Vec<usize> = result.results.iter().map(|b| b.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    assert_eq!(result.into_flat_results(), items(50));
}

#[tokio::test]
async fn cancellation_stops_before_next_batch() {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let result = scheduler(10, 1)
        .process(
            items(100),
            move |batch: Vec<u32>, index, _token| {
                counter.fetch_add(1, Ordering::SeqCst);
                if index == 1 {
                    trigger.cancel();
                }
                async move { Ok::<_, anyhow::Error>(batch) }
            },
            &token,
        )
        .await;

    assert_eq!(runs.load(Ordering::SeqCst), 2, "batch 1 finishes, nothing after it starts");
    assert!(result.cancelled);
    assert!(!result.success);
    assert!(result.errors.is_empty());
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.progress.completed_batches, 2);
    assert!(!result.progress.is_finished());
}

#[tokio::test]
async fn concurrent_failure_leaves_sibling_batches_intact() {
    let result = scheduler(10, 3)
        .process(
            items(50),
            |batch: Vec<u32>, index, _token| async move {
                tokio::time::sleep(Duration::from_millis(5 + (index % 2) as u64 * 10)).await;
                if index == 2 {
                    anyhow::bail!("disk full");
                }
                Ok::<_, anyhow::Error>(batch)
            },
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.success);
    assert!(!result.cancelled);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].index, 2);
    assert_eq!(result.errors[0].items, 20..30);
    let indices: Vec<usize> = result.results.iter().map(|b| b.index).collect();
    assert_eq!(indices, vec![0, 1, 3, 4]);
    assert_eq!(result.progress.completed_batches, 4);
    assert_eq!(result.progress.failed_batches, 1);
}

#[tokio::test]
async fn concurrent_cancellation_stops_waiting_batches() {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let started = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&started);

    let result = scheduler(10, 2)
        .process(
            items(100),
            move |batch: Vec<u32>, index, _token| {
                seen.lock().unwrap().push(index);
                if index == 1 {
                    trigger.cancel();
                }
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            &token,
        )
        .await;

    let mut started = started.lock().unwrap().clone();
    started.sort_unstable();
    assert_eq!(started, vec![0, 1], "batches waiting for a permit never start");
    assert!(result.cancelled);
    assert!(!result.success);
    assert!(result.errors.is_empty());
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.progress.total_batches, 10);
    assert!(!result.progress.is_finished());
}

#[tokio::test]
async fn inter_batch_delay_spaces_sequential_batches() {
    let config = BatchConfig {
        batch_size: 10,
        max_concurrency: 1,
        inter_batch_delay_ms: 30,
        ..BatchConfig::default()
    };
    let scheduler = BatchScheduler::new(config, None).unwrap();

    let started = Instant::now();
    let result = scheduler
        .process(
            items(40),
            |batch: Vec<u32>, _, _| async move { Ok::<_, anyhow::Error>(batch) },
            &CancellationToken::new(),
        )
        .await;
    let elapsed = started.elapsed();

    assert!(result.success);
    assert_eq!(result.results.len(), 4);
    assert!(elapsed >= Duration::from_millis(90), "three gaps of 30ms, took {elapsed:?}");
}

#[tokio::test]
async fn observers_survive_failing_peers_and_can_unregister() {
    let scheduler = scheduler(10, 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let last_percent = Arc::new(Mutex::new(0.0f64));

    scheduler.on_progress(|_| anyhow::bail!("dashboard offline"));
    scheduler.on_progress(|_| panic!("observer bug"));
    let (counter, percent) = (Arc::clone(&calls), Arc::clone(&last_percent));
    let id = scheduler.on_progress(move |progress| {
        counter.fetch_add(1, Ordering::SeqCst);
        *percent.lock().unwrap() = progress.percent;
        Ok(())
    });

    let result = scheduler
        .process(
            items(40),
            |batch: Vec<u32>, _, _| async move { Ok::<_, anyhow::Error>(batch) },
            &CancellationToken::new(),
        )
        .await;
    assert!(result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!((*last_percent.lock().unwrap() - 100.0).abs() < 1e-9);

    assert!(scheduler.off_progress(id));
    assert!(!scheduler.off_progress(id));
    scheduler
        .process(
            items(40),
            |batch: Vec<u32>, _, _| async move { Ok::<_, anyhow::Error>(batch) },
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn empty_input_succeeds_with_no_batches() {
    let result = scheduler(10, 2)
        .process(
            Vec::<u32>::new(),
            |batch: Vec<u32>, _, _| async move { Ok::<_, anyhow::Error>(batch) },
            &CancellationToken::new(),
        )
        .await;
    assert!(result.success);
    assert_eq!(result.progress.total_batches, 0);
    assert!(result.results.is_empty());
}

/// Always reports the same system usage.
struct FixedProbe(u64);

impl MemoryProbe for FixedProbe {
    fn read(&self) -> Result<MemoryReading, PressureError> {
        Ok(MemoryReading {
            rss_bytes: 64 * 1024 * 1024,
            system_used_bytes: self.0,
            system_total_bytes: 100,
        })
    }
}

#[tokio::test]
async fn sustained_pressure_triggers_bounded_gc_and_pauses() {
    let gc_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&gc_calls);
    let hook: Arc<dyn GcHook> = Arc::new(FnGcHook::new("counting", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let pressure = PressureConfig {
        max_gc_attempts: 2,
        gc_retry_wait_ms: 1,
        critical_pause_ms: 1,
        ..PressureConfig::default()
    };
    let monitor = PressureMonitor::with_parts(pressure, Arc::new(FixedProbe(92)), Some(hook)).unwrap();
    let config = BatchConfig {
        batch_size: 10,
        pressure_pause_ms: 1,
        ..BatchConfig::default()
    };
    let scheduler = BatchScheduler::new(config, Some(monitor)).unwrap();

    let result = scheduler
        .process(
            items(30),
            |batch: Vec<u32>, _, _| async move { Ok::<_, anyhow::Error>(batch) },
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "pressure slows batches down but never fails them");
    assert_eq!(gc_calls.load(Ordering::SeqCst), 6, "two attempts per batch");
    assert_eq!(result.metrics.gc_triggers, 6);
    // Critical pause inside relief plus the scheduler's own pause, per batch.
    assert_eq!(result.metrics.pressure_pauses, 6);
    assert_eq!(result.metrics.peak_pressure_level, Some(PressureLevel::Critical));
    assert!((result.metrics.peak_pressure_pct.unwrap() - 92.0).abs() < 1e-9);
}

#[tokio::test]
async fn cancellation_cuts_pressure_pauses_short() {
    let pressure = PressureConfig {
        max_gc_attempts: 1,
        gc_retry_wait_ms: 1,
        critical_pause_ms: 1_500,
        ..PressureConfig::default()
    };
    let hook: Arc<dyn GcHook> = Arc::new(FnGcHook::new("noop", || Ok(())));
    let monitor = PressureMonitor::with_parts(pressure, Arc::new(FixedProbe(95)), Some(hook)).unwrap();
    let config = BatchConfig {
        batch_size: 10,
        pressure_pause_ms: 1_500,
        ..BatchConfig::default()
    };
    let scheduler = BatchScheduler::new(config, Some(monitor)).unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let started = Instant::now();
    let result = scheduler
        .process(
            items(30),
            move |batch: Vec<u32>, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>(batch) }
            },
            &token,
        )
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(500), "waited out the pauses: {elapsed:?}");
    assert!(result.cancelled);
    assert!(result.results.is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(result.metrics.pressure_pauses, 0, "interrupted pauses are not counted");
}

#[tokio::test]
async fn low_pressure_runs_without_gc() {
    let monitor =
        PressureMonitor::with_parts(PressureConfig::default(), Arc::new(FixedProbe(40)), None).unwrap();
    let config = BatchConfig {
        batch_size: 10,
        ..BatchConfig::default()
    };
    let scheduler = BatchScheduler::new(config, Some(monitor)).unwrap();
    let result = scheduler
        .process(
            items(30),
            |batch: Vec<u32>, _, _| async move { Ok::<_, anyhow::Error>(batch) },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.metrics.gc_triggers, 0);
    assert_eq!(result.metrics.pressure_pauses, 0);
    assert_eq!(result.metrics.peak_pressure_level, Some(PressureLevel::Low));
}

#[tokio::test]
async fn resume_reruns_only_unfinished_batches() {
    let scheduler = scheduler(10, 1);
    let first = scheduler
        .process(
            items(35),
            |batch: Vec<u32>, index, _| async move {
                if index == 1 {
                    anyhow::bail!("transient failure");
                }
                Ok::<_, anyhow::Error>(batch)
            },
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(first.errors.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.json");
    first.checkpoint(Uuid::new_v4()).unwrap().save(&path).unwrap();
    let checkpoint = Checkpoint::load(&path).unwrap();

    let reran = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&reran);
    let second = scheduler
        .process_resuming(
            items(35),
            move |batch: Vec<u32>, index, _| {
                seen.lock().unwrap().push(index);
                async move { Ok::<_, anyhow::Error>(batch) }
            },
            &CancellationToken::new(),
            &checkpoint,
        )
        .await;

    assert!(second.success);
    assert_eq!(*reran.lock().unwrap(), vec![1]);
    assert_eq!(second.results.len(), 1);
    assert_eq!(second.results[0].items, 10..20);
    assert_eq!(second.progress.skipped_batches, 3);
    assert_eq!(second.progress.total_batches, 4);
    assert_eq!(second.progress.processed_items, 35);
    assert!(second.progress.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_fan_out_to_worker_pool() {
    let registry = HandlerRegistry::new()
        .with("double", |v: Value| -> anyhow::Result<Value> {
            let n = v.as_u64().ok_or_else(|| anyhow::anyhow!("not a number"))?;
            Ok(json!(n * 2))
        })
        .unwrap();
    let pool_config = PoolConfig {
        min_workers: 1,
        max_workers: 4,
        ..PoolConfig::default()
    };
    let pool = WorkerPool::new(pool_config, registry).unwrap();

    let result = scheduler(8, 2)
        .process(
            items(40),
            |batch: Vec<u32>, _, token: CancellationToken| {
                let pool = pool.clone();
                async move {
                    let calls = batch.into_iter().map(|n| {
                        let options = TaskOptions::new().with_cancellation(token.clone());
                        let pool = pool.clone();
                        async move { pool.execute("double", json!(n), options).await }
                    });
                    let mut out = Vec::new();
                    for value in futures::future::join_all(calls).await {
                        out.push(value?.as_u64().unwrap_or_default());
                    }
                    Ok::<_, anyhow::Error>(out)
                }
            },
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    let flat = result.into_flat_results();
    assert_eq!(flat, (1..=40u64).map(|n| n * 2).collect::<Vec<_>>());
    assert_eq!(pool.stats().completed_tasks, 40);
    pool.destroy().await;
}
