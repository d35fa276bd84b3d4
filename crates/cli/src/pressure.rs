use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use sluice_compute::pressure::{EffectivenessReport, GcOutcome, PressureMonitor, PressureSample};
use sluice_core::EngineConfig;

use crate::cli::PressureArgs;
use crate::terminal::Terminal;

#[derive(Debug, Serialize)]
struct PressureReport {
    gc_available: bool,
    samples: Vec<PressureSample>,
    gc: Vec<GcOutcome>,
    effectiveness: EffectivenessReport,
}

/// `sluice pressure`: sample memory pressure, optionally trigger GC after
/// each sample, then report how much GC reclaimed.
pub async fn pressure(config: EngineConfig, args: PressureArgs, terminal: &Terminal) -> Result<()> {
    let monitor = PressureMonitor::new(config.pressure).context("failed to start pressure monitor")?;
    let report = collect(&monitor, &args).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    terminal.print_header(
        "pressure",
        &format!(
            "{} samples every {}ms, gc hook {}",
            args.samples,
            args.interval_ms,
            if report.gc_available { "available" } else { "unavailable" }
        ),
    )?;
    let mut outcomes = report.gc.iter();
    for (i, sample) in report.samples.iter().enumerate() {
        terminal.print_sample(i + 1, sample)?;
        if args.gc {
            if let Some(outcome) = outcomes.next() {
                terminal.print_gc(outcome)?;
            }
        }
    }
    terminal.print_effectiveness(&report.effectiveness)?;
    Ok(())
}

async fn collect(monitor: &PressureMonitor, args: &PressureArgs) -> Result<PressureReport> {
    let interval = Duration::from_millis(args.interval_ms);
    let mut samples = Vec::with_capacity(args.samples);

    for i in 0..args.samples {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        let sample = monitor.sample().context("failed to sample memory")?;
        info!(level = %sample.level, pct = sample.pct, "Pressure sample");
        samples.push(sample);
        if args.gc {
            monitor.trigger_gc("cli").context("failed to trigger GC")?;
        }
    }

    Ok(PressureReport {
        gc_available: monitor.gc_available(),
        samples,
        gc: monitor.gc_history(),
        effectiveness: monitor.analyze_effectiveness(),
    })
}
