use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use sluice_compute::{global, BatchResult, BatchScheduler, Checkpoint, PoolStats, PressureMonitor, TaskOptions};
use sluice_core::EngineConfig;

use crate::cli::RunArgs;
use crate::config::apply_run_overrides;
use crate::handlers;
use crate::terminal::Terminal;

#[derive(Serialize)]
struct RunReport<'a> {
    result: &'a BatchResult<Value>,
    pool: &'a PoolStats,
}

/// `sluice run`: push `args.items` synthetic items through the scheduler,
/// fanning every item of a batch out to the worker pool.
pub async fn run(config: EngineConfig, args: RunArgs, terminal: &Terminal) -> Result<()> {
    let config = apply_run_overrides(config, &args)?;
    let registry = handlers::registry()?;
    if !registry.contains(&args.task) {
        bail!(
            "unknown task '{}', expected one of: {}",
            args.task,
            registry.task_types().join(", ")
        );
    }

    let previous = match &args.resume {
        Some(path) => Some(
            Checkpoint::load(path)
                .with_context(|| format!("failed to load checkpoint: {}", path.display()))?,
        ),
        None => None,
    };

    let monitor = PressureMonitor::new(config.pressure.clone()).context("failed to start pressure monitor")?;
    let scheduler = BatchScheduler::new(config.batch.clone(), Some(monitor))?;

    let token = terminal.cancellation_token();

    if !args.json {
        terminal.print_header(
            "run",
            &format!(
                "{} x {} (batch {}, concurrency {}, workers {}..{})",
                args.items,
                args.task,
                scheduler.batch_size(),
                config.batch.max_concurrency,
                config.pool.min_workers,
                config.pool.max_workers,
            ),
        )?;
        let progress_terminal = terminal.clone();
        scheduler.on_progress(move |progress| progress_terminal.print_progress(progress));
    }

    // Last fallible step before the run: nothing below returns early until
    // the pool is shut down again.
    let pool = global::install_default_pool(config.pool.clone(), registry)
        .context("failed to start worker pool")?;
    terminal.watch_ctrl_c();

    let task = args.task.clone();
    let work = args.work;
    let batch_fn = |batch: Vec<usize>, _index: usize, token: CancellationToken| {
        let pool = pool.clone();
        let task = task.clone();
        async move {
            let calls = batch.into_iter().map(|item| {
                let options = TaskOptions::new().with_cancellation(token.clone());
                pool.execute(&task, handlers::payload(&task, item, work), options)
            });
            let results = futures::future::try_join_all(calls).await?;
            Ok::<_, anyhow::Error>(results)
        }
    };

    let items: Vec<usize> = (0..args.items).collect();
    let result = match &previous {
        Some(checkpoint) => {
            if !args.json {
                terminal.print_info(&format!(
                    "Resuming session {} ({} items already processed)",
                    checkpoint.session_id,
                    checkpoint.processed_items.len()
                ))?;
            }
            scheduler.process_resuming(items, batch_fn, &token, checkpoint).await
        }
        None => scheduler.process(items, batch_fn, &token).await,
    };

    let stats = pool.stats();
    global::shutdown_default_pool().await;

    if let Some(path) = &args.checkpoint {
        let session_id = previous.as_ref().map_or_else(Uuid::new_v4, |p| p.session_id);
        let mut checkpoint = result.checkpoint(session_id)?;
        if let Some(previous) = &previous {
            carry_forward(previous, &mut checkpoint);
        }
        checkpoint
            .save(path)
            .with_context(|| format!("failed to save checkpoint: {}", path.display()))?;
        if !args.json {
            terminal.print_info(&format!("Checkpoint written to {}", path.display()))?;
        }
    }

    if args.json {
        let report = RunReport { result: &result, pool: &stats };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        terminal.print_batch_summary(&result)?;
        terminal.print_pool_stats(&stats)?;
    }

    info!(
        success = result.success,
        cancelled = result.cancelled,
        failed_batches = result.errors.len(),
        "Run finished"
    );
    if result.cancelled {
        warn!("Run was cancelled before every batch started");
    }
    Ok(())
}

/// Fold a resumed run's checkpoint into the new one so batches finished in
/// earlier sessions stay recorded.
fn carry_forward(previous: &Checkpoint, next: &mut Checkpoint) {
    next.processed_items.extend_from_slice(&previous.processed_items);
    next.processed_items.sort_unstable();
    next.processed_items.dedup();
    next.current_batch = next.current_batch.max(previous.current_batch);

    let mut records: Vec<Value> = match (&previous.results, &mut next.results) {
        (Value::Array(old), Value::Array(new)) => old.iter().cloned().chain(new.drain(..)).collect(),
        (_, Value::Array(new)) => new.drain(..).collect(),
        _ => Vec::new(),
    };
    records.sort_by_key(|record| record["index"].as_u64().unwrap_or(u64::MAX));
    records.dedup_by_key(|record| record["index"].as_u64());
    next.results = Value::Array(records);
}
