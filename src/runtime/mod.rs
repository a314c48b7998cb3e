//! Container execution gateway
//!
//! A narrow, uniform interface over the container engine: run, exec, logs,
//! state transitions and image management. Components receive it as an
//! `Arc<dyn ContainerRuntime>` so a session can run against the local Docker
//! engine or against an in-memory double in tests.

mod docker;

pub use docker::DockerRuntime;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tracing::debug;

use crate::common::{Error, Result};
use crate::poll::{poll_until, PollPolicy, Readiness};

/// Path of the engine socket inside and outside containers
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Reference to a created container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Engine-assigned container ID
    pub id: String,
    /// Name, when one was requested or resolved
    pub name: Option<String>,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Name if known, else the short ID
    pub fn label(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => &self.id[..self.id.len().min(12)],
        }
    }
}

/// A host path bind-mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// Engine bind syntax: `host:container:ro|rw`
    pub fn to_bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Network a container joins
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Engine default bridge
    #[default]
    Default,
    /// Share the host network stack
    Host,
    /// A named user network such as `kind`
    Named(String),
}

impl NetworkMode {
    /// Name to pass to the engine, `None` for the default bridge
    pub fn engine_name(&self) -> Option<&str> {
        match self {
            NetworkMode::Default => None,
            NetworkMode::Host => Some("host"),
            NetworkMode::Named(name) => Some(name),
        }
    }
}

/// Port published from a container to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Everything needed to launch one container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    pub name: Option<String>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeMount>,
    pub network: NetworkMode,
    pub dns: Vec<String>,
    pub ports: Vec<PublishedPort>,
    pub privileged: bool,
    pub user: Option<String>,
}

impl RunSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn dns(mut self, server: impl Into<String>) -> Self {
        self.dns.push(server.into());
        self
    }

    pub fn publish(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.push(PublishedPort {
            container_port,
            host_port,
            protocol: "tcp".to_string(),
        });
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }
}

/// Exit code and combined stdout/stderr of an exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle status as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// The container will not run again without being restarted
    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Inspected container state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    /// Engine-level error string; empty or `None` when the engine saw none
    pub error: Option<String>,
}

impl ContainerState {
    /// Exited with code 0 and no engine error
    pub fn succeeded(&self) -> bool {
        self.status.is_terminal()
            && self.exit_code == Some(0)
            && self.error.as_deref().map_or(true, str::is_empty)
    }
}

/// Log chunks that end when the container stops
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// Operations on the container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a detached container, pulling the image if missing
    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle>;

    /// Resolve an existing container by name or ID
    async fn find(&self, name: &str) -> Result<ContainerHandle>;

    /// Inspect the container's lifecycle state
    async fn state(&self, handle: &ContainerHandle) -> Result<ContainerState>;

    /// IP address on `network`, or on any attached network when `None`
    async fn ip_address(&self, handle: &ContainerHandle, network: Option<&str>)
        -> Result<Option<String>>;

    /// Run a command inside a running container and capture its output
    async fn exec(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        user: Option<&str>,
    ) -> Result<ExecResult>;

    /// Follow stdout/stderr until the container stops
    fn logs(&self, handle: &ContainerHandle) -> LogStream;

    /// Block until the container exits; returns its exit code
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64>;

    /// Stop the container; stopping a stopped container succeeds
    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove the container and its anonymous volumes
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// Content ID (`sha256:...`) of a local image
    async fn image_id(&self, reference: &str) -> Result<String>;

    /// Default user an image declares, if any
    async fn image_user(&self, reference: &str) -> Result<Option<String>>;

    /// Import an image archive into the engine; returns the loaded references
    async fn load_image(&self, archive: &Path) -> Result<Vec<String>>;

    /// Remove an image from the engine
    async fn remove_image(&self, reference: &str) -> Result<()>;
}

/// Wait until a freshly started container reports `running`.
///
/// A container that exits while we wait will never become ready, so that
/// aborts the poll with the container's exit code.
pub async fn wait_running(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    policy: &PollPolicy,
) -> Result<()> {
    let stage = format!("container '{}' to run", handle.label());
    poll_until(&stage, policy, move || async move {
        let state = runtime.state(handle).await?;
        match state.status {
            ContainerStatus::Running => Ok(Readiness::Ready),
            status if status.is_terminal() => Err(Error::ContainerFailed {
                container: handle.label().to_string(),
                exit_code: state.exit_code.unwrap_or(-1),
                error: state.error.clone().filter(|e| !e.is_empty()),
                logs: String::new(),
            }),
            status => Ok(Readiness::NotReady(format!("status is {status}"))),
        }
    })
    .await?
    .into_result(&stage)?;
    debug!(container = %handle.label(), "container running");
    Ok(())
}

/// Stop, wait for and remove a container; one already gone counts as removed
pub async fn discard(runtime: &dyn ContainerRuntime, handle: &ContainerHandle) -> Result<()> {
    let result = async {
        runtime.stop(handle).await?;
        runtime.wait(handle).await?;
        runtime.remove(handle).await
    }
    .await;
    match result {
        Err(e) if e.is_not_found() => {
            debug!(container = %handle.label(), "container already removed");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_syntax() {
        let ro = VolumeMount::read_only("/tmp/kubeconfig-x", "/app/kubeconfig");
        assert_eq!(ro.to_bind(), "/tmp/kubeconfig-x:/app/kubeconfig:ro");
        let rw = VolumeMount::read_write("/tmp/out", "/app/reports");
        assert_eq!(rw.to_bind(), "/tmp/out:/app/reports:rw");
    }

    #[test]
    fn test_state_success_requires_empty_error() {
        let mut state = ContainerState {
            status: ContainerStatus::Exited,
            exit_code: Some(0),
            error: Some(String::new()),
        };
        assert!(state.succeeded());
        state.error = Some("OCI runtime create failed".to_string());
        assert!(!state.succeeded());
        state.error = None;
        state.exit_code = Some(1);
        assert!(!state.succeeded());
    }

    #[test]
    fn test_handle_label_prefers_name() {
        let handle = ContainerHandle::new("0123456789abcdef0123", None);
        assert_eq!(handle.label(), "0123456789ab");
        let named = ContainerHandle::new("0123", Some("perf-control-plane".to_string()));
        assert_eq!(named.label(), "perf-control-plane");
    }

    #[test]
    fn test_network_engine_name() {
        assert_eq!(NetworkMode::Default.engine_name(), None);
        assert_eq!(NetworkMode::Host.engine_name(), Some("host"));
        assert_eq!(NetworkMode::Named("kind".into()).engine_name(), Some("kind"));
    }
}
