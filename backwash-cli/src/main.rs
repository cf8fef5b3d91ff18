//! Backwash CLI - Command-line interface
//!
//! Runs the relay server and inspects saved rewind dumps.

mod commands;

use anyhow::Context;
use backwash_core::tracing_setup::{CliLogLevel, init_tracing};
use clap::Parser;

#[derive(Parser)]
#[command(name = "backwash")]
#[command(about = "Live audio relay with rewind buffering")]
#[command(version)]
struct Cli {
    /// Console log level (the log file under ./logs always records everything)
    #[arg(long, global = true, default_value = "info")]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None).context("initializing logging")?;

    commands::handle_command(cli.command).await
}
