mod cli;
mod config;
mod handlers;
mod pressure;
mod run;
mod terminal;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use crate::cli::{CliArgs, Command};
use crate::terminal::Terminal;

#[tokio::main]
async fn main() -> Result<()> {
    sluice_core::load_dotenv();
    let args = CliArgs::parse();

    // RUST_LOG wins over --verbose.
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let terminal = Terminal::new();
    let config = config::load(args.config.as_deref()).context("failed to load configuration")?;
    config.log_summary();

    let outcome = match args.command {
        Command::Run(run_args) => run::run(config, run_args, &terminal).await,
        Command::Pressure(pressure_args) => pressure::pressure(config, pressure_args, &terminal).await,
        Command::Config => serde_json::to_string_pretty(&config)
            .map(|json| println!("{json}"))
            .map_err(Into::into),
    };

    if let Err(e) = outcome {
        error!(error = %e, "Command failed");
        terminal.print_error(&format!("{e:#}"))?;
        std::process::exit(1);
    }
    Ok(())
}
