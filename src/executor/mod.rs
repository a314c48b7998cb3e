//! Runs the workload's test runner against a ready cluster
//!
//! The runner container gets the cluster kubeconfig and the materialized
//! configuration bind-mounted read-only, plus an optional writable report
//! directory. Its output is streamed into the log while it runs; once it
//! exits the container state is checked, the report read and validated, and
//! the container removed whatever the outcome.

pub mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cluster::{KindCluster, KIND_NETWORK};
use crate::common::config::{HarnessConfig, RunnerNetwork};
use crate::common::{paths, Error, Result};
use crate::materialize::RunnerConfig;
use crate::runtime::{self, ContainerHandle, ContainerRuntime, NetworkMode, RunSpec, VolumeMount};

pub use report::{Test, TestReport, TestResult};

/// Environment variable selecting the report format
pub const REPORT_FORMAT_ENV: &str = "TEST_RUNNER_REPORT_FORMAT";
/// Environment variable holding the in-container report path
pub const REPORT_FILE_ENV: &str = "TEST_RUNNER_REPORT_FILE";

/// Where the runner writes its JSON report inside its container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    pub dir_mount_path: String,
    pub file_name: String,
}

impl ReportOptions {
    /// In-container path of the report file
    pub fn container_file(&self) -> String {
        format!(
            "{}/{}",
            self.dir_mount_path.trim_end_matches('/'),
            self.file_name
        )
    }
}

/// How to launch the runner container
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub image: String,
    pub name: Option<String>,
    pub network: NetworkMode,
    /// DNS server handed to the runner
    pub dns: Option<String>,
    /// In-container path of the materialized configuration
    pub config_mount_path: String,
    /// Collect a report; `None` runs without one
    pub report: Option<ReportOptions>,
}

impl RunnerOptions {
    pub fn from_config(config: &HarnessConfig, image: impl Into<String>) -> Self {
        let runner = &config.runner;
        Self {
            image: image.into(),
            name: Some(format!("{}-runner", config.cluster.name)),
            network: match runner.network {
                RunnerNetwork::Host => NetworkMode::Host,
                RunnerNetwork::Kind => NetworkMode::Named(KIND_NETWORK.to_string()),
            },
            dns: None,
            config_mount_path: runner.config_mount_path.clone(),
            report: runner.collect_report.then(|| ReportOptions {
                dir_mount_path: runner.report_dir_mount_path.clone(),
                file_name: runner.report_file_name.clone(),
            }),
        }
    }
}

/// Result of a completed, successful runner invocation
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i64,
    /// Everything the runner printed
    pub logs: String,
    /// Validated report, when one was requested
    pub report: Option<TestReport>,
}

/// Launches and supervises runner containers
pub struct TestRunExecutor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl TestRunExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Run the runner to completion and validate what it reported.
    ///
    /// A non-zero exit or engine error is a [`Error::ContainerFailed`]
    /// carrying the runner's logs; a bad report is [`Error::ReportInvalid`].
    /// The container is stopped and removed on every path.
    pub async fn run(
        &self,
        cluster: &KindCluster,
        config: &RunnerConfig,
        options: &RunnerOptions,
    ) -> Result<RunOutcome> {
        let report_dir = match &options.report {
            Some(_) => {
                let dir = tempfile::Builder::new().prefix("runner-reports-").tempdir()?;
                paths::share_dir(dir.path())?;
                Some(dir)
            }
            None => None,
        };

        let spec = Self::run_spec(cluster.kubeconfig_path()?, config, options, report_dir.as_ref());
        info!(image = %options.image, network = ?options.network, "Starting test runner");
        let handle = self.runtime.run(&spec).await?;

        let result = self
            .supervise(&handle, cluster, options, report_dir.as_ref())
            .await;

        debug!(container = %handle.label(), "removing runner container");
        let cleanup = runtime::discard(&*self.runtime, &handle).await;

        match (result, cleanup) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(container = %handle.label(), error = %cleanup, "Failed to remove runner container");
                Err(e)
            }
        }
    }

    fn run_spec(
        kubeconfig: &Path,
        config: &RunnerConfig,
        options: &RunnerOptions,
        report_dir: Option<&TempDir>,
    ) -> RunSpec {
        let mut spec = RunSpec::new(&options.image)
            .command(["--config", options.config_mount_path.as_str()])
            .volume(VolumeMount::read_only(kubeconfig, config.kubeconfig_mount_path()))
            .volume(VolumeMount::read_only(config.path(), &options.config_mount_path))
            .network(options.network.clone());

        if let (Some(report), Some(dir)) = (&options.report, report_dir) {
            spec = spec
                .volume(VolumeMount::read_write(dir.path(), &report.dir_mount_path))
                .env(REPORT_FORMAT_ENV, "json")
                .env(REPORT_FILE_ENV, report.container_file());
        }
        if let Some(server) = &options.dns {
            spec = spec.dns(server);
        }
        if let Some(name) = &options.name {
            spec = spec.name(name);
        }
        spec
    }

    async fn supervise(
        &self,
        handle: &ContainerHandle,
        cluster: &KindCluster,
        options: &RunnerOptions,
        report_dir: Option<&TempDir>,
    ) -> Result<RunOutcome> {
        let logs = self.stream_logs(handle).await;
        let exit_code = self.runtime.wait(handle).await?;
        let state = self.runtime.state(handle).await?;

        if exit_code != 0 || !state.succeeded() {
            return Err(Error::ContainerFailed {
                container: handle.label().to_string(),
                exit_code: state.exit_code.unwrap_or(exit_code),
                error: state.error.filter(|e| !e.is_empty()),
                logs,
            });
        }
        info!(container = %handle.label(), "Test runner exited cleanly");

        let report = match (&options.report, report_dir) {
            (Some(report), Some(dir)) => {
                let path: PathBuf = dir.path().join(&report.file_name);
                let parsed = TestReport::load(&path)?;
                info!("Test report:\n{}", parsed.render_text());
                parsed.validate(&cluster.control_plane_node_name())?;
                Some(parsed)
            }
            _ => None,
        };

        Ok(RunOutcome {
            exit_code,
            logs,
            report,
        })
    }

    /// Forward the runner's output line by line until it stops
    async fn stream_logs(&self, handle: &ContainerHandle) -> String {
        let mut stream = self.runtime.logs(handle);
        let mut lines = LineBuffer::default();
        let mut captured = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(container = %handle.label(), error = %e, "Runner log stream ended early");
                    break;
                }
            };
            let text = String::from_utf8_lossy(&chunk);
            captured.push_str(&text);
            for line in lines.push(&text) {
                info!(target: "runner", "{line}");
            }
        }
        if let Some(rest) = lines.finish() {
            info!(target: "runner", "{rest}");
        }
        captured
    }
}

/// Reassembles lines split across log chunks
#[derive(Debug, Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then_some(self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push("Running test lat").is_empty());
        assert_eq!(buffer.push("ency-check\r\nnode "), vec!["Running test latency-check"]);
        assert_eq!(buffer.push("ready\n\n"), vec!["node ready", ""]);
        assert_eq!(buffer.push("done"), Vec::<String>::new());
        assert_eq!(buffer.finish().as_deref(), Some("done"));
    }

    #[test]
    fn test_report_file_path() {
        let report = ReportOptions {
            dir_mount_path: "/app/reports/".to_string(),
            file_name: "report.json".to_string(),
        };
        assert_eq!(report.container_file(), "/app/reports/report.json");
    }

    #[test]
    fn test_options_follow_network_setting() {
        let mut config = HarnessConfig::default();
        let host = RunnerOptions::from_config(&config, "test-runner:test");
        assert_eq!(host.network, NetworkMode::Host);
        assert_eq!(host.name.as_deref(), Some("k8s-node-perf-evaluator-runner"));
        assert!(host.report.is_some());

        config.runner.network = RunnerNetwork::Kind;
        config.runner.collect_report = false;
        let kind = RunnerOptions::from_config(&config, "test-runner:test");
        assert_eq!(kind.network, NetworkMode::Named("kind".to_string()));
        assert!(kind.report.is_none());
    }
}
