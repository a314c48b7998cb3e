//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};
use crate::poll::PollPolicy;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct HarnessConfig {
    /// Ephemeral cluster settings
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Ingress controller settings
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Runner container settings
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Optional DNS stub settings
    #[serde(default)]
    pub dns: DnsConfig,

    /// Workload images to make available inside the cluster
    #[serde(default)]
    pub workload: WorkloadConfig,
}

/// Cluster bootstrap settings
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Cluster name; must be unique per concurrent session
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Image of the privileged container that runs kind and kubectl
    #[serde(default = "default_bootstrapper_image")]
    pub bootstrapper_image: String,

    /// Shell command installing kind and kubectl inside the bootstrapper
    #[serde(default = "default_install_command")]
    pub install_command: String,

    /// `apiVersion` of the kind cluster document
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// User to run bootstrapper commands as (default: image user, else root)
    #[serde(default)]
    pub exec_user: Option<String>,

    /// Host ports mapped into the control-plane node
    #[serde(default = "default_port_mappings")]
    pub port_mappings: Vec<PortMappingConfig>,

    /// Polling for `kubectl get nodes` to succeed
    #[serde(default = "default_readiness")]
    pub readiness: PollConfig,

    /// Polling for containers to reach the running state
    #[serde(default = "default_container_wait")]
    pub container_wait: PollConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            bootstrapper_image: default_bootstrapper_image(),
            install_command: default_install_command(),
            api_version: default_api_version(),
            exec_user: None,
            port_mappings: default_port_mappings(),
            readiness: default_readiness(),
            container_wait: default_container_wait(),
        }
    }
}

fn default_cluster_name() -> String {
    "k8s-node-perf-evaluator".to_string()
}
fn default_bootstrapper_image() -> String {
    "docker:latest".to_string()
}
fn default_install_command() -> String {
    "apk update && apk add kubectl kind".to_string()
}
fn default_api_version() -> String {
    "kind.x-k8s.io/v1alpha4".to_string()
}
fn default_port_mappings() -> Vec<PortMappingConfig> {
    vec![
        PortMappingConfig {
            container_port: 80,
            host_port: 80,
            protocol: default_protocol(),
        },
        PortMappingConfig {
            container_port: 443,
            host_port: 443,
            protocol: default_protocol(),
        },
    ]
}
fn default_readiness() -> PollConfig {
    PollConfig {
        max_attempts: 15,
        interval_ms: 2_000,
    }
}
fn default_container_wait() -> PollConfig {
    PollConfig {
        max_attempts: 30,
        interval_ms: 500,
    }
}

/// One host-to-node port mapping
#[derive(Debug, Deserialize, Clone)]
pub struct PortMappingConfig {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Bounded fixed-interval polling
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl From<PollConfig> for PollPolicy {
    fn from(config: PollConfig) -> Self {
        PollPolicy::new(config.max_attempts, Duration::from_millis(config.interval_ms))
    }
}

/// Ingress controller settings
#[derive(Debug, Deserialize, Clone)]
pub struct IngressConfig {
    /// Manifest applied with `kubectl apply -f`
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,

    #[serde(default = "default_ingress_namespace")]
    pub namespace: String,

    /// Label selector of the controller deployment and pods
    #[serde(default = "default_ingress_selector")]
    pub selector: String,

    /// Timeout for rollout status and pod readiness, each
    #[serde(default = "default_ingress_timeout")]
    pub timeout_secs: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            namespace: default_ingress_namespace(),
            selector: default_ingress_selector(),
            timeout_secs: default_ingress_timeout(),
        }
    }
}

fn default_manifest_url() -> String {
    "https://kind.sigs.k8s.io/examples/ingress/deploy-ingress-nginx.yaml".to_string()
}
fn default_ingress_namespace() -> String {
    "ingress-nginx".to_string()
}
fn default_ingress_selector() -> String {
    "app.kubernetes.io/component=controller".to_string()
}
fn default_ingress_timeout() -> u64 {
    180
}

/// How the runner container reaches the cluster
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunnerNetwork {
    /// Host network; the API server is reached on 127.0.0.1
    #[default]
    Host,
    /// The `kind` docker network; the API server is reached by node name
    Kind,
}

/// Runner container settings
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerSettings {
    /// Runner image reference
    #[serde(default)]
    pub image: Option<String>,

    /// Base runner configuration document (YAML)
    #[serde(default)]
    pub base_config: Option<PathBuf>,

    #[serde(default = "default_kubeconfig_mount")]
    pub kubeconfig_mount_path: String,

    #[serde(default = "default_config_mount")]
    pub config_mount_path: String,

    #[serde(default = "default_report_dir_mount")]
    pub report_dir_mount_path: String,

    #[serde(default = "default_report_file")]
    pub report_file_name: String,

    /// Mount an output directory and collect the JSON report
    #[serde(default = "default_true")]
    pub collect_report: bool,

    #[serde(default)]
    pub network: RunnerNetwork,

    /// Grace period when stopping the runner container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            image: None,
            base_config: None,
            kubeconfig_mount_path: default_kubeconfig_mount(),
            config_mount_path: default_config_mount(),
            report_dir_mount_path: default_report_dir_mount(),
            report_file_name: default_report_file(),
            collect_report: true,
            network: RunnerNetwork::default(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

fn default_kubeconfig_mount() -> String {
    "/app/kubeconfig".to_string()
}
fn default_config_mount() -> String {
    "/app/config.yaml".to_string()
}
fn default_report_dir_mount() -> String {
    "/app/reports".to_string()
}
fn default_report_file() -> String {
    "report.json".to_string()
}
fn default_true() -> bool {
    true
}
fn default_stop_timeout() -> u64 {
    10
}

/// DNS stub settings
#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_dns_image")]
    pub image: String,

    /// Where unmatched queries are forwarded
    #[serde(default = "default_dns_upstream")]
    pub upstream: String,

    /// Zones answered with the control-plane IP ("." answers everything)
    #[serde(default = "default_dns_zones")]
    pub zones: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: default_dns_image(),
            upstream: default_dns_upstream(),
            zones: default_dns_zones(),
        }
    }
}

fn default_dns_image() -> String {
    "coredns/coredns:1.11.3".to_string()
}
fn default_dns_upstream() -> String {
    "/etc/resolv.conf".to_string()
}
fn default_dns_zones() -> Vec<String> {
    vec![".".to_string()]
}

/// Workload images
#[derive(Debug, Deserialize, Default, Clone)]
pub struct WorkloadConfig {
    /// Image references already present in the local engine
    #[serde(default)]
    pub images: Vec<String>,

    /// Image tarballs to import first; removed from the engine at teardown
    #[serde(default)]
    pub archives: Vec<PathBuf>,
}

impl HarnessConfig {
    /// Load configuration from `path`, or from the default config file
    ///
    /// Returns default configuration if no path is given and the default
    /// file doesn't exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => config_path().filter(|p| p.exists()),
        };
        let config = match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(&path).map_err(|e| Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    })?;
                Self::parse(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Reject settings that would only fail later, deep inside a session
    pub fn validate(&self) -> Result<()> {
        let name = &self.cluster.name;
        let valid_label = !name.is_empty()
            && name.len() <= 50
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name.starts_with('-')
            && !name.ends_with('-');
        if !valid_label {
            return Err(Error::Config(format!(
                "cluster name '{}' must be 1-50 lowercase letters, digits or '-'",
                name
            )));
        }

        for (label, poll) in [
            ("cluster.readiness", &self.cluster.readiness),
            ("cluster.container_wait", &self.cluster.container_wait),
        ] {
            if poll.max_attempts == 0 {
                return Err(Error::Config(format!("{label}.max_attempts must be at least 1")));
            }
        }

        for (label, path) in [
            ("runner.kubeconfig_mount_path", &self.runner.kubeconfig_mount_path),
            ("runner.config_mount_path", &self.runner.config_mount_path),
            ("runner.report_dir_mount_path", &self.runner.report_dir_mount_path),
        ] {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "{label} must be an absolute in-container path, got '{path}'"
                )));
            }
        }

        if self.dns.enabled && self.runner.network == RunnerNetwork::Host {
            return Err(Error::Config(
                "dns.enabled requires runner.network = \"kind\"".to_string(),
            ));
        }
        Ok(())
    }

    /// Make the cluster name unique to this process
    ///
    /// Concurrent sessions on one engine must not share a cluster name.
    pub fn make_cluster_name_unique(&mut self) {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() % 1_000_000)
            .unwrap_or_default();
        let suffix = format!("-{}-{}", std::process::id(), millis);
        let keep = 50usize.saturating_sub(suffix.len());
        let base: String = self.cluster.name.chars().take(keep).collect();
        self.cluster.name = format!("{}{}", base.trim_end_matches('-'), suffix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_session() {
        let config = HarnessConfig::default();
        assert_eq!(config.cluster.name, "k8s-node-perf-evaluator");
        assert_eq!(config.cluster.readiness.max_attempts, 15);
        assert_eq!(config.cluster.port_mappings.len(), 2);
        assert_eq!(config.ingress.timeout_secs, 180);
        assert_eq!(config.runner.kubeconfig_mount_path, "/app/kubeconfig");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = HarnessConfig::parse(
            r#"
            [cluster]
            name = "perf-ci"

            [cluster.readiness]
            max_attempts = 3
            interval_ms = 10

            [runner]
            image = "test-runner:test"
            network = "kind"
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.name, "perf-ci");
        assert_eq!(config.cluster.readiness.max_attempts, 3);
        assert_eq!(config.cluster.bootstrapper_image, "docker:latest");
        assert_eq!(config.runner.image.as_deref(), Some("test-runner:test"));
        assert_eq!(config.runner.network, RunnerNetwork::Kind);
        assert_eq!(config.ingress.namespace, "ingress-nginx");
    }

    #[test]
    fn test_rejects_invalid_cluster_name() {
        let mut config = HarnessConfig::default();
        config.cluster.name = "Perf_Cluster".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = HarnessConfig::default();
        config.cluster.readiness.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_relative_mount_path() {
        let mut config = HarnessConfig::default();
        config.runner.config_mount_path = "config.yaml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dns_requires_kind_network() {
        let mut config = HarnessConfig::default();
        config.dns.enabled = true;
        assert!(config.validate().is_err());
        config.runner.network = RunnerNetwork::Kind;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unique_name_stays_valid() {
        let mut config = HarnessConfig::default();
        config.make_cluster_name_unique();
        assert!(config.cluster.name.starts_with("k8s-node-perf-evaluator-"));
        assert!(config.validate().is_ok());
    }
}
