//! DNS stub for runners on the kind network
//!
//! A CoreDNS container answers A queries in the configured zones with the
//! control-plane node's address, so ingress hostnames the workload uses
//! resolve to the cluster, and forwards everything else upstream.

use std::io::Write;
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{info, warn};

use crate::cluster::KIND_NETWORK;
use crate::common::config::HarnessConfig;
use crate::common::{paths, Error, Result};
use crate::poll::PollPolicy;
use crate::runtime::{self, ContainerHandle, ContainerRuntime, NetworkMode, RunSpec, VolumeMount};

const COREFILE_DIR: &str = "/etc/coredns";
const ANSWER_TTL: u32 = 60;

/// DNS stub settings
#[derive(Debug, Clone)]
pub struct DnsOptions {
    pub image: String,
    pub name: String,
    pub upstream: String,
    pub zones: Vec<String>,
    pub container_wait: PollPolicy,
}

impl DnsOptions {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            image: config.dns.image.clone(),
            name: format!("{}-dns", config.cluster.name),
            upstream: config.dns.upstream.clone(),
            zones: config.dns.zones.clone(),
            container_wait: config.cluster.container_wait.into(),
        }
    }
}

/// Render a Corefile templating A answers to `answer_ip`
pub fn corefile(answer_ip: &str, zones: &[String], upstream: &str) -> String {
    let zones = if zones.is_empty() {
        ".".to_string()
    } else {
        zones.join(" ")
    };
    format!(
        ". {{
    template IN A {zones} {{
        answer \"{{{{ .Name }}}} {ANSWER_TTL} IN A {answer_ip}\"
        fallthrough
    }}
    forward . {upstream}
    errors
    log
}}
"
    )
}

/// A running DNS stub container
pub struct DnsStub {
    runtime: Arc<dyn ContainerRuntime>,
    handle: Option<ContainerHandle>,
    ip: String,
    config_dir: Option<TempDir>,
}

impl DnsStub {
    /// Start the stub on the kind network, answering with `answer_ip`
    pub async fn start(
        runtime: Arc<dyn ContainerRuntime>,
        options: &DnsOptions,
        answer_ip: &str,
    ) -> Result<Self> {
        let config_dir = tempfile::Builder::new().prefix("dns-stub-").tempdir()?;
        let corefile_path = config_dir.path().join("Corefile");
        let mut file = std::fs::File::create(&corefile_path)?;
        file.write_all(corefile(answer_ip, &options.zones, &options.upstream).as_bytes())?;
        paths::share_dir(config_dir.path())?;
        paths::share_file(&corefile_path)?;

        let spec = RunSpec::new(&options.image)
            .name(&options.name)
            .command(["-conf", "/etc/coredns/Corefile"])
            .volume(VolumeMount::read_only(config_dir.path(), COREFILE_DIR))
            .network(NetworkMode::Named(KIND_NETWORK.to_string()));

        info!(image = %options.image, answer = %answer_ip, "Starting DNS stub");
        let handle = runtime.run(&spec).await?;

        let ip = match Self::resolve(&*runtime, &handle, &options.container_wait).await {
            Ok(ip) => ip,
            Err(e) => {
                if let Err(cleanup) = runtime::discard(&*runtime, &handle).await {
                    warn!(container = %handle.label(), error = %cleanup, "Failed to remove DNS stub");
                }
                return Err(e);
            }
        };
        info!(container = %handle.label(), ip = %ip, "DNS stub ready");

        Ok(Self {
            runtime,
            handle: Some(handle),
            ip,
            config_dir: Some(config_dir),
        })
    }

    async fn resolve(
        runtime: &dyn ContainerRuntime,
        handle: &ContainerHandle,
        policy: &PollPolicy,
    ) -> Result<String> {
        runtime::wait_running(runtime, handle, policy).await?;
        runtime
            .ip_address(handle, Some(KIND_NETWORK))
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "DNS stub '{}' has no address on the {KIND_NETWORK} network",
                    handle.label()
                ))
            })
    }

    /// Address to hand to clients as their DNS server
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Remove the container and its Corefile; a second call does nothing
    pub async fn stop(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        if let Some(handle) = self.handle.take() {
            info!(container = %handle.label(), "Stopping DNS stub");
            if let Err(e) = runtime::discard(&*self.runtime, &handle).await {
                failures.push(format!("remove DNS stub '{}': {e}", handle.label()));
            }
        }
        if let Some(dir) = self.config_dir.take() {
            let path = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                failures.push(format!("delete '{path}': {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corefile_answers_all_names() {
        let corefile = corefile("172.18.0.2", &[".".to_string()], "/etc/resolv.conf");
        assert!(corefile.starts_with(". {\n"));
        assert!(corefile.contains("template IN A . {"));
        assert!(corefile.contains(r#"answer "{{ .Name }} 60 IN A 172.18.0.2""#));
        assert!(corefile.contains("forward . /etc/resolv.conf"));
    }

    #[test]
    fn test_corefile_limits_zones() {
        let zones = vec!["perf.local".to_string(), "example.test".to_string()];
        let corefile = corefile("10.0.0.5", &zones, "8.8.8.8");
        assert!(corefile.contains("template IN A perf.local example.test {"));
        assert!(corefile.contains("forward . 8.8.8.8"));
    }

    #[test]
    fn test_options_name_follows_cluster() {
        let options = DnsOptions::from_config(&HarnessConfig::default());
        assert_eq!(options.name, "k8s-node-perf-evaluator-dns");
        assert_eq!(options.image, "coredns/coredns:1.11.3");
    }
}
