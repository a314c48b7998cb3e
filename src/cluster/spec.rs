//! Declarative kind cluster document
//!
//! Rendered to YAML and fed to `kind create cluster --config=-`.

use serde::{Deserialize, Serialize};

use crate::common::config::ClusterConfig;
use crate::common::Result;

/// `kind: Cluster` document with a single control-plane node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub kind: String,
    pub api_version: String,
    pub nodes: Vec<NodeSpec>,
}

/// Role of a node in the kind topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
}

/// One node of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub role: NodeRole,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_port_mappings: Vec<PortMapping>,
}

/// Host port forwarded into the node container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

impl ClusterSpec {
    /// Single control-plane node exposing host 80/443 to the ingress controller
    pub fn single_node(api_version: impl Into<String>) -> Self {
        Self {
            kind: "Cluster".to_string(),
            api_version: api_version.into(),
            nodes: vec![NodeSpec {
                role: NodeRole::ControlPlane,
                extra_port_mappings: vec![
                    PortMapping::tcp(80, 80),
                    PortMapping::tcp(443, 443),
                ],
            }],
        }
    }

    /// Build the document from configuration
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            kind: "Cluster".to_string(),
            api_version: config.api_version.clone(),
            nodes: vec![NodeSpec {
                role: NodeRole::ControlPlane,
                extra_port_mappings: config
                    .port_mappings
                    .iter()
                    .map(|m| PortMapping {
                        container_port: m.container_port,
                        host_port: m.host_port,
                        protocol: m.protocol.to_uppercase(),
                    })
                    .collect(),
            }],
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

impl PortMapping {
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            protocol: "TCP".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_yaml_shape() {
        let yaml = ClusterSpec::single_node("kind.x-k8s.io/v1alpha4")
            .to_yaml()
            .unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["kind"], "Cluster");
        assert_eq!(doc["apiVersion"], "kind.x-k8s.io/v1alpha4");
        let node = &doc["nodes"][0];
        assert_eq!(node["role"], "control-plane");
        assert_eq!(node["extraPortMappings"][0]["containerPort"], 80);
        assert_eq!(node["extraPortMappings"][1]["hostPort"], 443);
        assert_eq!(node["extraPortMappings"][1]["protocol"], "TCP");
        assert_eq!(doc["nodes"].as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn test_from_default_config_matches_single_node() {
        let spec = ClusterSpec::from_config(&ClusterConfig::default());
        assert_eq!(spec, ClusterSpec::single_node("kind.x-k8s.io/v1alpha4"));
    }
}
