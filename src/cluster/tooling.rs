//! Typed cluster-management operations
//!
//! The lifecycle manager talks to kind and kubectl only through
//! [`ClusterTooling`]. [`CliTooling`] backs every operation with a shell
//! command executed inside the bootstrapper container; a native API client
//! can implement the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::spec::ClusterSpec;
use crate::common::{Error, Result};
use crate::runtime::{ContainerHandle, ContainerRuntime, ExecResult};

/// Namespace plus label selector of a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub namespace: String,
    pub labels: String,
}

impl Selector {
    pub fn new(namespace: impl Into<String>, labels: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            labels: labels.into(),
        }
    }
}

/// Cluster operations needed to bring a test cluster up and down
#[async_trait]
pub trait ClusterTooling: Send + Sync {
    /// Install the cluster-management CLIs
    async fn install(&self) -> Result<()>;

    /// Create the cluster from a declarative document, replacing a stale one
    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<()>;

    /// `get nodes`; a non-zero exit means "not ready yet", not failure
    async fn get_nodes(&self) -> Result<ExecResult>;

    async fn apply_manifest(&self, url: &str) -> Result<()>;

    /// Block until the selected deployments have rolled out
    async fn rollout_status(&self, target: &Selector, timeout: Duration) -> Result<()>;

    /// Block until the selected pods report Ready
    async fn wait_pod_ready(&self, target: &Selector, timeout: Duration) -> Result<()>;

    /// Kubeconfig document; `internal` addresses the API by node name
    async fn get_kubeconfig(&self, internal: bool) -> Result<String>;

    /// Copy an engine image into the node's image store
    async fn load_image(&self, image_id: &str) -> Result<()>;

    async fn delete_cluster(&self) -> Result<()>;
}

/// kind + kubectl invoked through `/bin/sh -c` in the bootstrapper
pub struct CliTooling {
    runtime: Arc<dyn ContainerRuntime>,
    container: ContainerHandle,
    cluster_name: String,
    user: String,
    install_command: String,
}

impl CliTooling {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container: ContainerHandle,
        cluster_name: impl Into<String>,
        user: impl Into<String>,
        install_command: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            container,
            cluster_name: cluster_name.into(),
            user: user.into(),
            install_command: install_command.into(),
        }
    }

    /// Run a shell command and return whatever it produced
    async fn sh(&self, command: &str) -> Result<ExecResult> {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()];
        let result = self
            .runtime
            .exec(&self.container, &argv, Some(&self.user))
            .await?;
        debug!(
            command = %first_line(command),
            exit_code = result.exit_code,
            output = %result.output.trim_end(),
            "bootstrapper exec"
        );
        Ok(result)
    }

    /// Run a shell command that must exit 0
    async fn sh_checked(&self, command: &str) -> Result<String> {
        let result = self.sh(command).await?;
        if result.success() {
            Ok(result.output)
        } else {
            Err(Error::command_failed(
                first_line(command),
                result.exit_code,
                &result.output,
            ))
        }
    }
}

#[async_trait]
impl ClusterTooling for CliTooling {
    async fn install(&self) -> Result<()> {
        self.sh_checked(&self.install_command).await.map(drop)
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<()> {
        // A cluster left behind by a crashed session would make create fail
        let stale = self.sh(&delete_command(&self.cluster_name)).await?;
        if !stale.success() {
            debug!(cluster = %self.cluster_name, "no stale cluster to delete");
        }
        self.sh_checked(&create_command(&self.cluster_name, &spec.to_yaml()?))
            .await
            .map(drop)
    }

    async fn get_nodes(&self) -> Result<ExecResult> {
        self.sh("kubectl get nodes").await
    }

    async fn apply_manifest(&self, url: &str) -> Result<()> {
        self.sh_checked(&format!("kubectl apply -f {}", shell_quote(url)))
            .await
            .map(drop)
    }

    async fn rollout_status(&self, target: &Selector, timeout: Duration) -> Result<()> {
        self.sh_checked(&format!(
            "kubectl rollout status deployment --namespace {} --selector={} --timeout={}s",
            shell_quote(&target.namespace),
            shell_quote(&target.labels),
            timeout.as_secs()
        ))
        .await
        .map(drop)
    }

    async fn wait_pod_ready(&self, target: &Selector, timeout: Duration) -> Result<()> {
        self.sh_checked(&format!(
            "kubectl wait pod --namespace {} --for=condition=ready --selector={} --timeout={}s",
            shell_quote(&target.namespace),
            shell_quote(&target.labels),
            timeout.as_secs()
        ))
        .await
        .map(drop)
    }

    async fn get_kubeconfig(&self, internal: bool) -> Result<String> {
        let mut command = format!("kind get kubeconfig --name {}", self.cluster_name);
        if internal {
            command.push_str(" --internal");
        }
        let output = self.sh_checked(&command).await?;
        kubeconfig_document(&output)
            .map(str::to_string)
            .ok_or_else(|| Error::command_failed(&command, 0, &output))
    }

    async fn load_image(&self, image_id: &str) -> Result<()> {
        self.sh_checked(&format!(
            "kind load docker-image --name {} {}",
            self.cluster_name,
            shell_quote(image_id)
        ))
        .await
        .map(drop)
    }

    async fn delete_cluster(&self) -> Result<()> {
        self.sh_checked(&delete_command(&self.cluster_name))
            .await
            .map(drop)
    }
}

fn delete_command(cluster_name: &str) -> String {
    format!("kind delete cluster --name {cluster_name}")
}

/// `kind create cluster` reading the document from a quoted heredoc
fn create_command(cluster_name: &str, document: &str) -> String {
    format!(
        "cat <<'EOF' | kind create cluster --name {cluster_name} --config=-\n{}\nEOF",
        document.trim_end()
    )
}

/// Single-quote a word for POSIX sh
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or(command)
}

/// Kubeconfig from exec output, dropping any warnings kind printed first
fn kubeconfig_document(output: &str) -> Option<&str> {
    let mut offset = 0;
    for line in output.split_inclusive('\n') {
        if line.starts_with("apiVersion:") {
            return Some(&output[offset..]);
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_command_uses_heredoc() {
        let spec = ClusterSpec::single_node("kind.x-k8s.io/v1alpha4");
        let command = create_command("perf", &spec.to_yaml().unwrap());
        assert!(command.starts_with("cat <<'EOF' | kind create cluster --name perf --config=-\n"));
        assert!(command.contains("role: control-plane"));
        assert!(command.ends_with("\nEOF"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ingress-nginx"), "ingress-nginx");
        assert_eq!(
            shell_quote("app.kubernetes.io/component=controller"),
            "app.kubernetes.io/component=controller"
        );
        assert_eq!(shell_quote("sha256:ab12"), "sha256:ab12");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_kubeconfig_document_skips_leading_warnings() {
        let clean = "apiVersion: v1\nkind: Config\n";
        assert_eq!(kubeconfig_document(clean), Some(clean));

        let noisy = format!("WARNING: ignoring unknown flag\n{clean}");
        assert_eq!(kubeconfig_document(&noisy), Some(clean));

        assert_eq!(kubeconfig_document("ERROR: no nodes found for cluster \"perf\"\n"), None);
        assert_eq!(kubeconfig_document("  apiVersion: nested\n"), None);
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("cat <<'EOF' | kind\nkind: Cluster"), "cat <<'EOF' | kind");
        assert_eq!(first_line("kubectl get nodes"), "kubectl get nodes");
    }
}
