//! perf-harness - ephemeral kind cluster test harness
//!
//! Boots a throwaway single-node kind cluster, runs a containerized load-test
//! runner against it and validates the report it writes.

use clap::Parser;
use commands::Commands;
use harness::{cli, commands, common::logging};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "perf-harness", about = "Ephemeral kind cluster test harness")]
#[command(version, long_about = None)]
struct Cli {
    /// Debug logging for the harness
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guard = logging::init_cli(cli.verbose, cli.log_file.as_deref());

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        drop(guard);
        std::process::exit(1);
    }
}
