//! One complete test session
//!
//! Setup order: cluster, imported image archives, images loaded into the
//! cluster, DNS stub, runner configuration, runner. Teardown releases the
//! same resources in reverse and always runs, whether the session passed,
//! failed validation or broke during setup.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::{ClusterOptions, KindCluster};
use crate::common::config::HarnessConfig;
use crate::common::{Error, Result};
use crate::dns::{DnsOptions, DnsStub};
use crate::executor::{RunOutcome, RunnerOptions, TestRunExecutor};
use crate::materialize::{ConfigMaterializer, RunnerConfig};
use crate::runtime::ContainerRuntime;

/// What a passing session produced
#[derive(Debug)]
pub struct SessionOutcome {
    pub cluster_name: String,
    /// Content IDs loaded into the cluster
    pub images: Vec<String>,
    pub run: RunOutcome,
}

/// Drives a session against one container runtime
pub struct Session {
    runtime: Arc<dyn ContainerRuntime>,
    config: HarnessConfig,
}

/// Everything a session has acquired so far
struct Resources {
    cluster: KindCluster,
    imported: Vec<String>,
    dns: Option<DnsStub>,
    runner_config: Option<RunnerConfig>,
}

impl Session {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: HarnessConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run the session end to end and tear everything down.
    ///
    /// A setup or run error wins over teardown problems, which are logged.
    /// When the session itself passed, teardown problems are the error.
    pub async fn run(&self) -> Result<SessionOutcome> {
        let runner_image = self
            .config
            .runner
            .image
            .clone()
            .ok_or_else(|| Error::Config("runner.image is not set".to_string()))?;

        let mut resources = Resources {
            cluster: KindCluster::new(self.runtime.clone(), ClusterOptions::from_config(&self.config)),
            imported: Vec::new(),
            dns: None,
            runner_config: None,
        };
        info!(cluster = %resources.cluster.name(), runner = %runner_image, "Starting test session");

        let result = self.execute(&mut resources, &runner_image).await;
        let teardown = resources.teardown(&*self.runtime).await;

        match (result, teardown) {
            (Ok(outcome), Ok(())) => {
                info!(cluster = %outcome.cluster_name, "Test session passed");
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!(error = %teardown, "Session teardown was incomplete");
                Err(e)
            }
        }
    }

    async fn execute(&self, resources: &mut Resources, runner_image: &str) -> Result<SessionOutcome> {
        let config = &self.config;
        let cluster = &mut resources.cluster;
        cluster.start().await?;

        for archive in &config.workload.archives {
            let loaded = self.runtime.load_image(archive).await?;
            info!(archive = %archive.display(), images = ?loaded, "Imported image archive");
            resources.imported.extend(loaded);
        }

        let images: Vec<&str> = config
            .workload
            .images
            .iter()
            .chain(&resources.imported)
            .map(String::as_str)
            .collect();
        let ids = cluster.load_images(&images).await?;

        let mut options = RunnerOptions::from_config(config, runner_image);
        if config.dns.enabled {
            let answer = cluster.control_plane_node_ip().await?;
            let stub = DnsStub::start(
                self.runtime.clone(),
                &DnsOptions::from_config(config),
                &answer,
            )
            .await?;
            options.dns = Some(stub.ip().to_string());
            resources.dns = Some(stub);
        }

        let runner_config = resources.runner_config.insert(
            ConfigMaterializer::new().materialize(
                config.runner.base_config.as_deref(),
                &config.runner.kubeconfig_mount_path,
            )?,
        );

        let run = TestRunExecutor::new(self.runtime.clone())
            .run(cluster, runner_config, &options)
            .await?;

        Ok(SessionOutcome {
            cluster_name: cluster.name().to_string(),
            images: ids,
            run,
        })
    }
}

impl Resources {
    /// Release in reverse acquisition order; every step runs
    async fn teardown(mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let mut failures = Vec::new();

        if let Some(config) = self.runner_config.take() {
            if let Err(e) = config.release() {
                failures.push(format!("runner config: {e}"));
            }
        }

        if let Some(mut stub) = self.dns.take() {
            if let Err(e) = stub.stop().await {
                failures.push(format!("DNS stub: {e}"));
            }
        }

        for reference in self.imported.drain(..).rev() {
            match runtime.remove_image(&reference).await {
                Ok(()) => info!(image = %reference, "Removed imported image"),
                Err(e) if e.is_not_found() => {}
                Err(e) => failures.push(format!("image '{reference}': {e}")),
            }
        }

        if let Err(e) = self.cluster.stop().await {
            failures.push(format!("cluster: {e}"));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown { failures })
        }
    }
}
