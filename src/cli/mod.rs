//! CLI command handling
//!
//! Runs each subcommand and formats its output.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::HarnessConfig;
use crate::common::{ErrorKind, Result};
use crate::executor::TestReport;
use crate::poll::PollPolicy;
use crate::runtime::DockerRuntime;
use crate::session::Session;
use crate::workload::WorkloadProbe;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            config,
            runner_image,
            base_config,
            images,
            unique,
        } => run(config.as_deref(), runner_image, base_config, images, unique).await,

        Commands::Validate { path, node } => {
            let report = TestReport::load(&path)?;
            print!("{}", report.render_text());
            report.validate(&node)?;
            println!(
                "\n{} {} is valid for node {}",
                "✓".green().bold(),
                path.display(),
                node.bold()
            );
            Ok(())
        }

        Commands::Report { path, json } => {
            let report = TestReport::load(&path)?;
            if json {
                println!("{}", report.render_json()?);
            } else {
                print!("{}", report.render_text());
            }
            Ok(())
        }

        Commands::Probe {
            url,
            attempts,
            interval_ms,
        } => {
            let probe = WorkloadProbe::new(&url)?;
            if attempts > 1 {
                probe
                    .wait_ready(&PollPolicy::new(attempts, Duration::from_millis(interval_ms)))
                    .await?;
            }
            let report = probe.probe().await?;
            println!("  {} GET {url}/ping", "✓".green());
            println!(
                "  {} GET {url}/cpu-intensive-task -> {}",
                "✓".green(),
                report.result.bold()
            );
            Ok(())
        }
    }
}

async fn run(
    config_path: Option<&Path>,
    runner_image: Option<String>,
    base_config: Option<PathBuf>,
    images: Vec<String>,
    unique: bool,
) -> Result<()> {
    let mut config = HarnessConfig::load(config_path)?;
    if let Some(image) = runner_image {
        config.runner.image = Some(image);
    }
    if let Some(path) = base_config {
        config.runner.base_config = Some(path);
    }
    config.workload.images.extend(images);
    if unique {
        config.make_cluster_name_unique();
    }
    config.validate()?;

    let runtime = DockerRuntime::connect()?.with_stop_timeout(config.runner.stop_timeout_secs);
    runtime.ping().await?;

    println!(
        "\n{} {}\n",
        "Test session:".blue().bold(),
        config.cluster.name.white().bold()
    );

    match Session::new(Arc::new(runtime), config).run().await {
        Ok(outcome) => {
            if let Some(report) = &outcome.run.report {
                print!("{}", report.render_text());
            }
            println!(
                "\n{} {} ({} image(s) loaded into {})",
                "✓".green().bold(),
                "Test Passed".green().bold(),
                outcome.images.len(),
                outcome.cluster_name
            );
            Ok(())
        }
        Err(e) => {
            let headline = match e.kind() {
                ErrorKind::ReportValidation => "Test Failed",
                ErrorKind::Teardown => "Teardown Failed",
                _ if e.is_setup_failure() => "Setup Failed",
                _ => "Session Failed",
            };
            println!("\n{} {}", "✗".red().bold(), headline.red().bold());
            Err(e)
        }
    }
}
