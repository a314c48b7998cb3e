//! Docker Engine API backend
//!
//! Talks to the engine over its local socket (or `DOCKER_HOST`) with bollard.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ImportImageOptions, RemoveImageOptions};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::{
    ContainerHandle, ContainerRuntime, ContainerState, ContainerStatus, ExecResult, LogStream,
    RunSpec,
};
use crate::common::error::is_engine_status;
use crate::common::{Error, Result};

/// Seconds the engine waits after SIGTERM before killing
const DEFAULT_STOP_GRACE_SECS: i64 = 10;

/// Container runtime backed by the local Docker engine
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_grace_secs: i64,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::from_client(docker))
    }

    /// Wrap an existing client
    pub fn from_client(docker: Docker) -> Self {
        Self {
            docker,
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
        }
    }

    /// Grace period between SIGTERM and SIGKILL on stop
    pub fn with_stop_timeout(mut self, secs: u64) -> Self {
        self.stop_grace_secs = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    /// Fail fast when the engine is unreachable
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Pull `reference` unless it is already present locally
    async fn ensure_image(&self, reference: &str) -> Result<()> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => return Ok(()),
            Err(e) if is_engine_status(&e, 404) => {}
            Err(e) => return Err(e.into()),
        }

        info!(image = %reference, "Pulling image");
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_for_each(|progress| async move {
                if let Some(status) = progress.status {
                    debug!(%status, "pull");
                }
                Ok(())
            })
            .await
            .map_err(|e| {
                if is_engine_status(&e, 404) {
                    Error::ImageNotFound(reference.to_string())
                } else {
                    e.into()
                }
            })
    }

    fn host_config(spec: &RunSpec) -> HostConfig {
        let binds: Vec<String> = spec.volumes.iter().map(|v| v.to_bind()).collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|p| {
                (
                    format!("{}/{}", p.container_port, p.protocol.to_lowercase()),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(p.host_port.to_string()),
                    }]),
                )
            })
            .collect();

        HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            network_mode: spec.network.engine_name().map(str::to_string),
            privileged: Some(spec.privileged),
            dns: (!spec.dns.is_empty()).then(|| spec.dns.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|p| {
                (
                    format!("{}/{}", p.container_port, p.protocol.to_lowercase()),
                    HashMap::new(),
                )
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            user: spec.user.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let created = self.docker.create_container(options, config).await?;
        for warning in &created.warnings {
            debug!(%warning, "create container");
        }
        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // no handle escapes on failure; the created container must not outlive it
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            if let Err(cleanup) = self.docker.remove_container(&created.id, Some(options)).await {
                warn!(container = %created.id, error = %cleanup, "Failed to remove container that did not start");
            }
            return Err(e.into());
        }

        let handle = ContainerHandle::new(created.id, spec.name.clone());
        debug!(container = %handle.label(), image = %spec.image, "started container");
        Ok(handle)
    }

    async fn find(&self, name: &str) -> Result<ContainerHandle> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(ContainerHandle::new(
                inspect.id.unwrap_or_else(|| name.to_string()),
                Some(name.to_string()),
            )),
            Err(e) if is_engine_status(&e, 404) => Err(Error::ContainerNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn state(&self, handle: &ContainerHandle) -> Result<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_engine_status(&e, 404) {
                    Error::ContainerNotFound(handle.label().to_string())
                } else {
                    e.into()
                }
            })?;

        let state = inspect.state.unwrap_or_default();
        let status = match state.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
            Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
            Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        };
        Ok(ContainerState {
            status,
            exit_code: state.exit_code,
            error: state.error,
        })
    }

    async fn ip_address(
        &self,
        handle: &ContainerHandle,
        network: Option<&str>,
    ) -> Result<Option<String>> {
        let inspect = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await?;
        let networks = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        let address = match network {
            Some(name) => networks.get(name).and_then(|e| e.ip_address.clone()),
            None => networks.values().find_map(|e| e.ip_address.clone()),
        };
        Ok(address.filter(|ip| !ip.is_empty()))
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        user: Option<&str>,
    ) -> Result<ExecResult> {
        let exec = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    user: user.map(str::to_string),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut output = String::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&chunk?.to_string());
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    fn logs(&self, handle: &ContainerHandle) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(&handle.id, Some(options))
            .map(|chunk| match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message })
                | Ok(LogOutput::StdIn { message }) => Ok(message),
                Err(e) => Err(Error::from(e)),
            })
            .boxed()
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(&handle.id, None::<WaitContainerOptions<String>>);
        let mut exit_code = 0;
        while let Some(response) = stream.next().await {
            match response {
                Ok(response) => exit_code = response.status_code,
                // bollard reports a non-zero exit as an error; it is still an exit
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code
                }
                Err(e) if is_engine_status(&e, 404) => {
                    return Err(Error::ContainerNotFound(handle.label().to_string()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(exit_code)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        match self
            .docker
            .stop_container(
                &handle.id,
                Some(StopContainerOptions {
                    t: self.stop_grace_secs,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_engine_status(&e, 304) => Ok(()),
            Err(e) if is_engine_status(&e, 404) => {
                Err(Error::ContainerNotFound(handle.label().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_engine_status(&e, 404) => {
                Err(Error::ContainerNotFound(handle.label().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn image_id(&self, reference: &str) -> Result<String> {
        let inspect = self.docker.inspect_image(reference).await.map_err(|e| {
            if is_engine_status(&e, 404) {
                Error::ImageNotFound(reference.to_string())
            } else {
                e.into()
            }
        })?;
        inspect
            .id
            .ok_or_else(|| Error::Internal(format!("engine returned no ID for image '{reference}'")))
    }

    async fn image_user(&self, reference: &str) -> Result<Option<String>> {
        let inspect = self.docker.inspect_image(reference).await?;
        Ok(inspect
            .config
            .and_then(|config| config.user)
            .filter(|user| !user.is_empty()))
    }

    async fn load_image(&self, archive: &Path) -> Result<Vec<String>> {
        let contents = tokio::fs::read(archive).await.map_err(|e| Error::FileRead {
            path: archive.display().to_string(),
            error: e.to_string(),
        })?;
        info!(archive = %archive.display(), "Importing image archive");
        let progress: Vec<_> = self
            .docker
            .import_image(ImportImageOptions { quiet: true }, Bytes::from(contents), None)
            .try_collect()
            .await?;

        let loaded: Vec<String> = progress
            .iter()
            .filter_map(|info| info.stream.as_deref())
            .flat_map(str::lines)
            .filter_map(loaded_reference)
            .collect();
        if loaded.is_empty() {
            return Err(Error::Internal(format!(
                "archive '{}' contained no images",
                archive.display()
            )));
        }
        Ok(loaded)
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(reference, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if is_engine_status(&e, 404) => Err(Error::ImageNotFound(reference.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reference from an import progress line such as `Loaded image: app:test`
fn loaded_reference(line: &str) -> Option<String> {
    let line = line.trim();
    line.strip_prefix("Loaded image ID: ")
        .or_else(|| line.strip_prefix("Loaded image: "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal engine: image present, create succeeds, start fails
    async fn engine_rejecting_start() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_engine(socket, seen.clone()));
            }
        });
        (format!("http://{addr}"), requests)
    }

    async fn serve_engine(mut socket: TcpStream, seen: Arc<Mutex<Vec<String>>>) {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let header_end = loop {
                if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                }
            };
            let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
            let body_len = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while buffer.len() < header_end + body_len {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                }
            }
            buffer.drain(..header_end + body_len);

            let request_line = head.lines().next().unwrap_or_default().to_string();
            seen.lock().unwrap().push(request_line.clone());

            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default();
            let path = parts.next().unwrap_or_default();
            let (status, body) = if method == "GET" && path.contains("/images/") {
                ("200 OK", r#"{"Id":"sha256:feed"}"#)
            } else if method == "POST" && path.contains("/containers/create") {
                ("201 Created", r#"{"Id":"abc123","Warnings":[]}"#)
            } else if method == "POST" && path.contains("/containers/abc123/start") {
                (
                    "500 Internal Server Error",
                    r#"{"message":"port is already allocated"}"#,
                )
            } else if method == "DELETE" && path.contains("/containers/abc123") {
                ("204 No Content", "")
            } else {
                ("404 Not Found", r#"{"message":"no such route"}"#)
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            if socket.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_run_removes_container_that_fails_to_start() {
        let (url, requests) = engine_rejecting_start().await;
        let docker =
            Docker::connect_with_http(&url, 5, bollard::API_DEFAULT_VERSION).unwrap();
        let runtime = DockerRuntime::from_client(docker);

        let spec = RunSpec::new("docker:latest")
            .name("perf-bootstrapper")
            .publish(80, 80);
        let err = runtime.run(&spec).await.unwrap_err();
        assert!(err.to_string().contains("port is already allocated"), "{err}");

        let requests = requests.lock().unwrap().clone();
        let start = requests
            .iter()
            .position(|r| r.starts_with("POST") && r.contains("/containers/abc123/start"))
            .expect("start was attempted");
        assert!(
            requests[start..]
                .iter()
                .any(|r| r.starts_with("DELETE") && r.contains("/containers/abc123")),
            "container was left behind: {requests:?}"
        );
    }

    #[test]
    fn test_loaded_reference() {
        assert_eq!(
            loaded_reference("Loaded image: test-service:test\n").as_deref(),
            Some("test-service:test")
        );
        assert_eq!(
            loaded_reference("Loaded image ID: sha256:ab12").as_deref(),
            Some("sha256:ab12")
        );
        assert_eq!(loaded_reference("Loading layer 1/3"), None);
    }
}
