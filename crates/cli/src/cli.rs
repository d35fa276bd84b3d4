use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Drive the sluice execution engine from the command line.
///
/// Runs synthetic workloads through the batch scheduler and worker pool,
/// inspects memory pressure, and prints the resolved configuration.
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about = "Adaptive concurrent execution engine")]
pub struct CliArgs {
    /// Path to config file (default: ~/.config/sluice/config.toml if present)
    #[arg(long, global = true, env = "SLUICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Push synthetic items through the batch scheduler and worker pool
    Run(RunArgs),
    /// Sample memory pressure and report GC effectiveness
    Pressure(PressureArgs),
    /// Print the resolved configuration as JSON
    Config,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of synthetic items to process
    #[arg(long, default_value = "1000")]
    pub items: usize,

    /// Handler each item is sent to: checksum or sleep
    #[arg(long, default_value = "checksum")]
    pub task: String,

    /// Bytes hashed per checksum item, or milliseconds per sleep item
    #[arg(long, default_value = "4096")]
    pub work: u64,

    /// Items per batch (overrides config; 0 = adaptive)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Batches in flight at once (overrides config)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Maximum pool workers (overrides config)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Per-task timeout in milliseconds (overrides config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Write a checkpoint of the finished run to this path
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Skip batches already recorded in this checkpoint
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// Print the full result as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PressureArgs {
    /// Number of samples to take
    #[arg(long, default_value = "5")]
    pub samples: usize,

    /// Milliseconds between samples
    #[arg(long, default_value = "500")]
    pub interval_ms: u64,

    /// Trigger GC after each sample
    #[arg(long)]
    pub gc: bool,

    /// Print samples and the effectiveness report as JSON
    #[arg(long)]
    pub json: bool,
}
