//! Ephemeral kind cluster lifecycle
//!
//! A [`KindCluster`] owns one short-lived single-node cluster: a privileged
//! bootstrapper container with the host engine socket mounted, the kind
//! cluster created from inside it, an ingress controller, and the kubeconfig
//! file handed to the runner. Setup walks a linear phase sequence; any
//! failure tears down whatever was already created before the error is
//! returned, so a caller never holds a half-built cluster.

pub mod spec;
pub mod tooling;

use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::common::config::HarnessConfig;
use crate::common::{paths, Error, Result};
use crate::poll::{poll_until, PollPolicy, Readiness};
use crate::runtime::{
    self, ContainerHandle, ContainerRuntime, NetworkMode, RunSpec, VolumeMount, DOCKER_SOCKET,
};

pub use spec::ClusterSpec;
pub use tooling::{CliTooling, ClusterTooling, Selector};

/// Docker network kind attaches its node containers to
pub const KIND_NETWORK: &str = "kind";

/// Lifecycle phase, in the order setup reaches them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterPhase {
    Created,
    BootstrapContainerRunning,
    ToolingInstalled,
    ClusterCreated,
    ControlPlaneReady,
    IngressInstalled,
    IngressReady,
    KubeconfigExtracted,
    Ready,
    ImagesLoaded,
    TornDown,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::BootstrapContainerRunning => write!(f, "bootstrap container running"),
            Self::ToolingInstalled => write!(f, "tooling installed"),
            Self::ClusterCreated => write!(f, "cluster created"),
            Self::ControlPlaneReady => write!(f, "control plane ready"),
            Self::IngressInstalled => write!(f, "ingress installed"),
            Self::IngressReady => write!(f, "ingress ready"),
            Self::KubeconfigExtracted => write!(f, "kubeconfig extracted"),
            Self::Ready => write!(f, "ready"),
            Self::ImagesLoaded => write!(f, "images loaded"),
            Self::TornDown => write!(f, "torn down"),
        }
    }
}

/// Ingress controller installation
#[derive(Debug, Clone)]
pub struct IngressOptions {
    pub manifest_url: String,
    pub selector: Selector,
    /// Bound on rollout status and on pod readiness, each
    pub timeout: Duration,
}

/// Everything needed to bring a cluster up
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub name: String,
    pub bootstrapper_image: String,
    pub install_command: String,
    pub exec_user: Option<String>,
    pub spec: ClusterSpec,
    pub ingress: IngressOptions,
    /// Polling for the API server to answer
    pub readiness: PollPolicy,
    /// Polling for containers to reach `running`
    pub container_wait: PollPolicy,
    /// Extract a kubeconfig addressing the API by node name on the kind network
    pub internal_kubeconfig: bool,
}

impl ClusterOptions {
    pub fn from_config(config: &HarnessConfig) -> Self {
        use crate::common::config::RunnerNetwork;

        Self {
            name: config.cluster.name.clone(),
            bootstrapper_image: config.cluster.bootstrapper_image.clone(),
            install_command: config.cluster.install_command.clone(),
            exec_user: config.cluster.exec_user.clone(),
            spec: ClusterSpec::from_config(&config.cluster),
            ingress: IngressOptions {
                manifest_url: config.ingress.manifest_url.clone(),
                selector: Selector::new(&config.ingress.namespace, &config.ingress.selector),
                timeout: Duration::from_secs(config.ingress.timeout_secs),
            },
            readiness: config.cluster.readiness.into(),
            container_wait: config.cluster.container_wait.into(),
            internal_kubeconfig: config.runner.network == RunnerNetwork::Kind,
        }
    }
}

/// One ephemeral kind cluster and everything it owns
pub struct KindCluster {
    runtime: Arc<dyn ContainerRuntime>,
    options: ClusterOptions,
    phase: ClusterPhase,
    bootstrapper: Option<ContainerHandle>,
    tooling: Option<Box<dyn ClusterTooling>>,
    create_attempted: bool,
    control_plane: Option<ContainerHandle>,
    kubeconfig: Option<NamedTempFile>,
    loaded_images: BTreeSet<String>,
}

impl KindCluster {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, options: ClusterOptions) -> Self {
        Self {
            runtime,
            options,
            phase: ClusterPhase::Created,
            bootstrapper: None,
            tooling: None,
            create_attempted: false,
            control_plane: None,
            kubeconfig: None,
            loaded_images: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    /// Bring the cluster to [`ClusterPhase::Ready`].
    ///
    /// On failure everything created so far is torn down and the cluster is
    /// left [`ClusterPhase::TornDown`]; the setup error is returned, teardown
    /// problems are only logged.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != ClusterPhase::Created {
            return Err(Error::invalid_state("start", self.phase));
        }

        match self.bootstrap().await {
            Ok(()) => {
                info!(cluster = %self.name(), "Kind cluster ready");
                Ok(())
            }
            Err(e) => {
                error!(
                    cluster = %self.name(),
                    phase = %self.phase,
                    error = %e,
                    "Cluster setup failed, tearing down"
                );
                if let Err(teardown) = self.stop().await {
                    warn!(cluster = %self.name(), error = %teardown, "Teardown after failed setup was incomplete");
                }
                Err(e)
            }
        }
    }

    async fn bootstrap(&mut self) -> Result<()> {
        let name = self.options.name.clone();

        info!(cluster = %name, image = %self.options.bootstrapper_image, "Starting bootstrapper container");
        let spec = RunSpec::new(&self.options.bootstrapper_image)
            .name(format!("{name}-bootstrapper"))
            .command(["sleep", "infinity"])
            .volume(VolumeMount::read_write(DOCKER_SOCKET, DOCKER_SOCKET))
            .network(NetworkMode::Host)
            .privileged(true);
        let bootstrapper = self.runtime.run(&spec).await?;
        self.bootstrapper = Some(bootstrapper.clone());
        runtime::wait_running(&*self.runtime, &bootstrapper, &self.options.container_wait).await?;
        self.advance(ClusterPhase::BootstrapContainerRunning);

        let user = self.exec_user().await?;
        info!(cluster = %name, user = %user, "Installing kind and kubectl");
        let tooling = CliTooling::new(
            self.runtime.clone(),
            bootstrapper,
            &name,
            user,
            &self.options.install_command,
        );
        tooling.install().await?;
        self.tooling = Some(Box::new(tooling));
        self.advance(ClusterPhase::ToolingInstalled);

        info!(cluster = %name, "Creating kind cluster");
        self.create_attempted = true;
        self.tooling()?.create_cluster(&self.options.spec).await?;
        self.advance(ClusterPhase::ClusterCreated);

        let node = self.runtime.find(&self.control_plane_node_name()).await?;
        self.control_plane = Some(node.clone());
        runtime::wait_running(&*self.runtime, &node, &self.options.container_wait).await?;

        info!(cluster = %name, "Waiting for control plane to accept commands");
        let tooling = self.tooling()?;
        poll_until("kind control plane", &self.options.readiness, move || async move {
            let nodes = tooling.get_nodes().await?;
            Ok(if nodes.success() {
                Readiness::Ready
            } else {
                Readiness::NotReady(nodes.output)
            })
        })
        .await?
        .into_result("kind control plane to accept commands")?;
        self.advance(ClusterPhase::ControlPlaneReady);

        info!(cluster = %name, manifest = %self.options.ingress.manifest_url, "Installing ingress controller");
        let ingress = self.options.ingress.clone();
        self.tooling()?.apply_manifest(&ingress.manifest_url).await?;
        self.advance(ClusterPhase::IngressInstalled);

        info!(cluster = %name, "Waiting for ingress controller rollout");
        self.tooling()?
            .rollout_status(&ingress.selector, ingress.timeout)
            .await?;
        info!(cluster = %name, "Waiting for ingress controller pod");
        self.tooling()?
            .wait_pod_ready(&ingress.selector, ingress.timeout)
            .await?;
        self.advance(ClusterPhase::IngressReady);

        let kubeconfig = self
            .tooling()?
            .get_kubeconfig(self.options.internal_kubeconfig)
            .await?;
        let file = self.persist_kubeconfig(&kubeconfig)?;
        info!(cluster = %name, path = %file.path().display(), "Kubeconfig written");
        self.kubeconfig = Some(file);
        self.advance(ClusterPhase::KubeconfigExtracted);

        self.advance(ClusterPhase::Ready);
        Ok(())
    }

    /// Load engine images into the cluster's image store.
    ///
    /// Images are referenced by content ID so no registry is involved; an ID
    /// this cluster already holds is skipped. Returns the IDs in input order.
    pub async fn load_images<S: AsRef<str>>(&mut self, images: &[S]) -> Result<Vec<String>> {
        self.ensure_ready("load images")?;

        let mut ids = Vec::with_capacity(images.len());
        for reference in images {
            let reference = reference.as_ref();
            let id = self.runtime.image_id(reference).await?;
            if self.loaded_images.contains(&id) {
                debug!(image = %reference, id = %id, "Image already loaded");
            } else {
                info!(cluster = %self.name(), image = %reference, id = %id, "Loading image into cluster");
                self.tooling()?.load_image(&id).await?;
                self.loaded_images.insert(id.clone());
                self.phase = ClusterPhase::ImagesLoaded;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Image IDs loaded so far
    pub fn loaded_images(&self) -> impl Iterator<Item = &str> {
        self.loaded_images.iter().map(String::as_str)
    }

    /// Host path of the kubeconfig; exists only while the cluster is ready
    pub fn kubeconfig_path(&self) -> Result<&Path> {
        self.ensure_ready("read kubeconfig")?;
        self.kubeconfig
            .as_ref()
            .map(|file| file.path())
            .ok_or_else(|| Error::invalid_state("read kubeconfig", self.phase))
    }

    /// Container and node name kind gives the control plane
    pub fn control_plane_node_name(&self) -> String {
        format!("{}-control-plane", self.options.name)
    }

    /// Address of the control-plane node on the kind network
    pub async fn control_plane_node_ip(&self) -> Result<String> {
        self.ensure_ready("resolve control plane IP")?;
        let node = self
            .control_plane
            .as_ref()
            .ok_or_else(|| Error::invalid_state("resolve control plane IP", self.phase))?;
        self.runtime
            .ip_address(node, Some(KIND_NETWORK))
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "'{}' has no address on the {KIND_NETWORK} network",
                    node.label()
                ))
            })
    }

    /// Tear down everything this cluster created.
    ///
    /// Deletes the kind cluster, then stops and removes the bootstrapper,
    /// then deletes the kubeconfig. Every step runs even if an earlier one
    /// fails; failures are reported together. Safe after a partial start and
    /// a no-op once torn down.
    pub async fn stop(&mut self) -> Result<()> {
        if self.phase == ClusterPhase::TornDown {
            return Ok(());
        }
        info!(cluster = %self.name(), phase = %self.phase, "Shutting down kind cluster");

        let mut failures = Vec::new();

        if self.create_attempted {
            if let Some(tooling) = &self.tooling {
                if let Err(e) = tooling.delete_cluster().await {
                    failures.push(format!("delete cluster '{}': {e}", self.options.name));
                }
            }
        }
        self.tooling = None;
        self.control_plane = None;
        self.create_attempted = false;

        if let Some(handle) = self.bootstrapper.take() {
            if let Err(e) = runtime::discard(&*self.runtime, &handle).await {
                failures.push(format!("remove bootstrapper '{}': {e}", handle.label()));
            }
        }

        if let Some(file) = self.kubeconfig.take() {
            let path = file.path().display().to_string();
            if let Err(e) = file.close() {
                failures.push(format!("delete kubeconfig '{path}': {e}"));
            }
        }

        self.loaded_images.clear();
        self.phase = ClusterPhase::TornDown;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown { failures })
        }
    }

    fn advance(&mut self, phase: ClusterPhase) {
        debug!(cluster = %self.options.name, from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }

    fn ensure_ready(&self, action: &str) -> Result<()> {
        match self.phase {
            ClusterPhase::Ready | ClusterPhase::ImagesLoaded => Ok(()),
            phase => Err(Error::invalid_state(action, phase)),
        }
    }

    fn tooling(&self) -> Result<&dyn ClusterTooling> {
        self.tooling
            .as_deref()
            .ok_or_else(|| Error::invalid_state("run cluster tooling", self.phase))
    }

    /// Configured user, else the image's declared user, else root
    async fn exec_user(&self) -> Result<String> {
        if let Some(user) = &self.options.exec_user {
            return Ok(user.clone());
        }
        let declared = self
            .runtime
            .image_user(&self.options.bootstrapper_image)
            .await?;
        Ok(declared.unwrap_or_else(|| "root".to_string()))
    }

    fn persist_kubeconfig(&self, contents: &str) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-kubeconfig-", self.options.name))
            .tempfile()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        paths::share_file(file.path())?;
        Ok(file)
    }
}

impl Drop for KindCluster {
    fn drop(&mut self) {
        if self.phase != ClusterPhase::TornDown && self.bootstrapper.is_some() {
            warn!(
                cluster = %self.options.name,
                "Cluster dropped without stop(); its containers are still running"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::RunnerNetwork;

    #[test]
    fn test_phases_are_ordered() {
        assert!(ClusterPhase::Created < ClusterPhase::BootstrapContainerRunning);
        assert!(ClusterPhase::IngressReady < ClusterPhase::KubeconfigExtracted);
        assert!(ClusterPhase::Ready < ClusterPhase::TornDown);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = HarnessConfig::default();
        config.runner.network = RunnerNetwork::Kind;
        let options = ClusterOptions::from_config(&config);
        assert_eq!(options.name, "k8s-node-perf-evaluator");
        assert_eq!(options.readiness.max_attempts, 15);
        assert_eq!(options.readiness.interval, Duration::from_secs(2));
        assert_eq!(options.ingress.selector.namespace, "ingress-nginx");
        assert_eq!(options.ingress.timeout, Duration::from_secs(180));
        assert!(options.internal_kubeconfig);
    }
}
