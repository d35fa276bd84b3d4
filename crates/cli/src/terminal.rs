use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sluice_compute::batch::BatchProgress;
use sluice_compute::pressure::{EffectivenessReport, GcOutcome, GcStatus, PressureLevel, PressureSample};
use sluice_compute::{BatchResult, PoolStats};

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const HEADER: Color = Color::Magenta;
    const OK: Color = Color::Green;
    const WARN: Color = Color::Yellow;
    const ERROR: Color = Color::Red;
    const DIM: Color = Color::DarkGrey;
    const VALUE: Color = Color::Cyan;
}

fn level_color(level: PressureLevel) -> Color {
    match level {
        PressureLevel::Low => Colors::OK,
        PressureLevel::Medium => Colors::VALUE,
        PressureLevel::High => Colors::WARN,
        PressureLevel::Critical => Colors::ERROR,
    }
}

fn fmt_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms >= 10_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{ms}ms")
    }
}

/// Colored summaries for the `sluice` subcommands.
#[derive(Clone)]
pub struct Terminal {
    cancel: CancellationToken,
}

impl Terminal {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled on the first Ctrl+C.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the run token when Ctrl+C arrives. Must be called inside a
    /// tokio runtime.
    pub fn watch_ctrl_c(&self) {
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        warn!("Ctrl+C received, finishing running batches");
                        token.cancel();
                    }
                    Err(e) => debug!(error = %e, "Ctrl+C handler unavailable"),
                },
                _ = token.cancelled() => {}
            }
        });
    }

    /// Print the startup banner.
    pub fn print_header(&self, title: &str, detail: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print(format!("sluice {title}")),
            ResetColor,
            SetForegroundColor(Colors::DIM),
            Print(format!(" - {detail}\n")),
            Print("---\n"),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Rewrite the current line with a progress snapshot.
    pub fn print_progress(&self, progress: &BatchProgress) -> Result<()> {
        let mut stdout = io::stdout();
        let eta = progress
            .estimated_remaining
            .map(fmt_duration)
            .unwrap_or_else(|| "-".into());
        let color = if progress.failed_batches > 0 { Colors::WARN } else { Colors::VALUE };
        execute!(
            stdout,
            Print("\r"),
            SetForegroundColor(color),
            Print(format!("{:>5.1}%", progress.percent)),
            ResetColor,
            SetForegroundColor(Colors::DIM),
            Print(format!(
                "  batches {}/{} (failed {})  items {}/{}  eta {}   ",
                progress.settled_batches(),
                progress.total_batches,
                progress.failed_batches,
                progress.processed_items,
                progress.total_items,
                eta,
            )),
            ResetColor,
        )?;
        if progress.is_finished() {
            execute!(stdout, Print("\n"))?;
        }
        stdout.flush()?;
        Ok(())
    }

    /// Print the outcome of a batch run.
    pub fn print_batch_summary<R>(&self, result: &BatchResult<R>) -> Result<()> {
        let mut stdout = io::stdout();
        let (color, status) = if result.cancelled {
            (Colors::WARN, "cancelled")
        } else if result.success {
            (Colors::OK, "succeeded")
        } else {
            (Colors::ERROR, "finished with failures")
        };
        let m = &result.metrics;
        let peak = match (m.peak_pressure_pct, m.peak_pressure_level) {
            (Some(pct), Some(level)) => format!("{pct:.1}% ({level})"),
            _ => "not sampled".into(),
        };

        execute!(
            stdout,
            Print("\n"),
            SetForegroundColor(color),
            Print(format!("Run {status}\n")),
            ResetColor,
            Print(format!(
                "  batches: {} completed, {} failed, {} skipped of {}\n",
                result.progress.completed_batches,
                result.progress.failed_batches,
                result.progress.skipped_batches,
                result.progress.total_batches,
            )),
            Print(format!(
                "  items:   {}/{} in {} ({:.1} items/s)\n",
                result.progress.processed_items,
                result.progress.total_items,
                fmt_duration(m.total_duration),
                m.items_per_sec,
            )),
            Print(format!(
                "  batch:   avg {}\n",
                fmt_duration(m.avg_batch_duration)
            )),
            Print(format!(
                "  memory:  peak {}, {} GC triggers, {} pauses\n",
                peak, m.gc_triggers, m.pressure_pauses
            )),
        )?;

        for failure in &result.errors {
            execute!(
                stdout,
                SetForegroundColor(Colors::ERROR),
                Print(format!("  {failure}\n")),
                ResetColor,
            )?;
        }
        stdout.flush()?;
        Ok(())
    }

    /// Print worker pool counters.
    pub fn print_pool_stats(&self, stats: &PoolStats) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("Worker pool\n"),
            ResetColor,
            Print(format!(
                "  workers: {} ({} spawned, {} evicted, {} faults)\n",
                stats.total_workers, stats.workers_spawned, stats.workers_evicted, stats.worker_faults
            )),
            Print(format!(
                "  tasks:   {} completed, {} failed, {} timed out, {} cancelled\n",
                stats.completed_tasks, stats.failed_tasks, stats.timed_out_tasks, stats.cancelled_tasks
            )),
            Print(format!(
                "  avg task {}\n",
                fmt_duration(stats.avg_task_duration)
            )),
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Print one pressure sample as a single line.
    pub fn print_sample(&self, index: usize, sample: &PressureSample) -> Result<()> {
        let mut stdout = io::stdout();
        let heap = sample
            .heap_pct
            .map(|pct| format!("{pct:.1}%"))
            .unwrap_or_else(|| "-".into());
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(format!("#{index:<3} ")),
            ResetColor,
            SetForegroundColor(level_color(sample.level)),
            Print(format!("{:<8}", sample.level.as_str())),
            ResetColor,
            Print(format!(
                " {:>5.1}%  rss {} MB  heap {}  system {:.1}%\n",
                sample.pct,
                sample.rss_bytes / (1024 * 1024),
                heap,
                sample.system_pct,
            )),
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Print a single GC outcome.
    pub fn print_gc(&self, outcome: &GcOutcome) -> Result<()> {
        let mut stdout = io::stdout();
        let line = match outcome.status {
            GcStatus::Completed => format!(
                "     gc freed {:.2} MB in {}\n",
                outcome.freed_mb(),
                fmt_duration(outcome.duration)
            ),
            GcStatus::Unavailable => "     gc unavailable on this platform\n".to_string(),
        };
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(line),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Print the GC effectiveness analysis.
    pub fn print_effectiveness(&self, report: &EffectivenessReport) -> Result<()> {
        let mut stdout = io::stdout();
        let color = if report.suspected_leak { Colors::ERROR } else { Colors::VALUE };
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("GC effectiveness\n"),
            ResetColor,
            Print(format!(
                "  samples: {} ({} unavailable)\n",
                report.samples, report.unavailable
            )),
            Print(format!(
                "  average: {:.2} MB freed in {}\n",
                report.avg_freed_mb,
                fmt_duration(report.avg_duration)
            )),
            SetForegroundColor(color),
            Print(format!("  rating:  {:?}\n", report.rating)),
            ResetColor,
            SetForegroundColor(Colors::DIM),
            Print(format!("  {}\n", report.recommendation)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Print an info message.
    pub fn print_info(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(format!("{}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Print an error message.
    pub fn print_error(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::ERROR),
            Print(format!("Error: {}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }
}
