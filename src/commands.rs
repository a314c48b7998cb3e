//! CLI command definitions
//!
//! Defines the clap commands for the perf-harness CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a complete test session: cluster, workload images, runner, report
    Run {
        /// Harness configuration file (default: platform config dir)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Runner image, overriding runner.image
        #[arg(long)]
        runner_image: Option<String>,

        /// Base runner configuration (YAML), overriding runner.base_config
        #[arg(long)]
        base_config: Option<PathBuf>,

        /// Workload image to load into the cluster; repeatable
        #[arg(long = "image", short = 'i')]
        images: Vec<String>,

        /// Make the cluster name unique to this process
        #[arg(long)]
        unique: bool,
    },

    /// Validate a saved JSON report
    Validate {
        /// Report file written by the runner
        path: PathBuf,

        /// Control-plane node every result must come from
        #[arg(long)]
        node: String,
    },

    /// Render a saved JSON report
    Report {
        /// Report file written by the runner
        path: PathBuf,

        /// Print JSON instead of a text table
        #[arg(long)]
        json: bool,
    },

    /// Smoke-test a running workload's HTTP endpoints
    Probe {
        /// Base URL, e.g. http://localhost:18080
        url: String,

        /// Attempts to wait for /ping before probing (1 = no waiting)
        #[arg(long, default_value_t = 1)]
        attempts: u32,

        /// Milliseconds between attempts
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}
