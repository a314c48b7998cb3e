//! Session-scoped runner configuration
//!
//! The runner's base configuration is written for the paths it sees inside
//! its own container. The materializer overlays the cluster-connection key
//! with the in-container kubeconfig mount path and writes the result to a
//! temporary file that can be bind-mounted read-only into the runner.

use std::io::Write;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::common::{paths, Error, Result};

/// Key the runner reads its kubeconfig location from
pub const KUBECONFIG_KEY: &str = "kubeConfig";

/// Produces [`RunnerConfig`] artifacts
#[derive(Debug, Clone)]
pub struct ConfigMaterializer {
    key: String,
}

impl Default for ConfigMaterializer {
    fn default() -> Self {
        Self {
            key: KUBECONFIG_KEY.to_string(),
        }
    }
}

impl ConfigMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override a different cluster-connection key
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Load `base_path` (an empty document when `None`), point the
    /// cluster-connection key at `kubeconfig_mount_path` and persist it.
    pub fn materialize(
        &self,
        base_path: Option<&Path>,
        kubeconfig_mount_path: &str,
    ) -> Result<RunnerConfig> {
        let base = match base_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| Error::FileRead {
                path: path.display().to_string(),
                error: e.to_string(),
            })?,
            None => String::new(),
        };
        let document = self.overlay(&base, kubeconfig_mount_path)?;
        let rendered = serde_yaml::to_string(&document)?;

        let mut file = tempfile::Builder::new()
            .prefix("runner-config-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(rendered.as_bytes())?;
        file.flush()?;
        paths::share_file(file.path())?;
        debug!(path = %file.path().display(), key = %self.key, "runner config written");

        Ok(RunnerConfig {
            file,
            document,
            kubeconfig_mount_path: kubeconfig_mount_path.to_string(),
        })
    }

    /// Overlay the cluster-connection key on a YAML document, keeping every
    /// other key as it was
    pub fn overlay(&self, base: &str, kubeconfig_mount_path: &str) -> Result<Mapping> {
        let mut document = match serde_yaml::from_str::<Value>(base)? {
            Value::Null => Mapping::new(),
            Value::Mapping(mapping) => mapping,
            other => {
                return Err(Error::Config(format!(
                    "runner base configuration must be a mapping, found {}",
                    value_kind(&other)
                )))
            }
        };
        document.insert(
            Value::String(self.key.clone()),
            Value::String(kubeconfig_mount_path.to_string()),
        );
        Ok(document)
    }
}

/// A materialized runner configuration file
///
/// The file lives as long as this value; dropping it deletes the file,
/// [`RunnerConfig::release`] does the same and reports failures.
#[derive(Debug)]
pub struct RunnerConfig {
    file: NamedTempFile,
    document: Mapping,
    kubeconfig_mount_path: String,
}

impl RunnerConfig {
    /// Host path of the artifact
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn document(&self) -> &Mapping {
        &self.document
    }

    /// In-container path the document points the runner at
    pub fn kubeconfig_mount_path(&self) -> &str {
        &self.kubeconfig_mount_path
    }

    /// Delete the artifact
    pub fn release(self) -> Result<()> {
        let path = self.file.path().display().to_string();
        self.file.close().map_err(|e| Error::FileRead {
            path,
            error: e.to_string(),
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
kubeConfig: /home/runner/.kube/config
nodeSelector:
  kubernetes.io/os: linux
iterations: 250
targets:
  - name: ping
    path: /ping
"#;

    #[test]
    fn test_overlay_replaces_only_the_connection_key() {
        let materializer = ConfigMaterializer::new();
        let document = materializer.overlay(BASE, "/app/kubeconfig").unwrap();

        let mut expected: Mapping = serde_yaml::from_str(BASE).unwrap();
        expected.insert("kubeConfig".into(), "/app/kubeconfig".into());
        assert_eq!(document, expected);
    }

    #[test]
    fn test_overlay_of_empty_base() {
        let materializer = ConfigMaterializer::new();
        for base in ["", "~", "# nothing here\n"] {
            let document = materializer.overlay(base, "/app/kubeconfig").unwrap();
            assert_eq!(document.len(), 1);
            assert_eq!(document["kubeConfig"], "/app/kubeconfig");
        }
    }

    #[test]
    fn test_overlay_rejects_non_mapping() {
        let materializer = ConfigMaterializer::new();
        let err = materializer.overlay("- a\n- b\n", "/app/kubeconfig").unwrap_err();
        assert!(err.to_string().contains("a sequence"));
    }

    #[test]
    fn test_custom_key() {
        let materializer = ConfigMaterializer::with_key("kubeconfigPath");
        let document = materializer.overlay("kubeConfig: x\n", "/k").unwrap();
        assert_eq!(document["kubeconfigPath"], "/k");
        assert_eq!(document["kubeConfig"], "x");
    }

    #[test]
    fn test_materialized_file_reloads_and_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("config.yaml");
        std::fs::write(&base, BASE).unwrap();

        let config = ConfigMaterializer::new()
            .materialize(Some(&base), "/app/kubeconfig")
            .unwrap();
        let path = config.path().to_path_buf();
        assert_eq!(config.kubeconfig_mount_path(), "/app/kubeconfig");

        let reloaded: Mapping =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(&reloaded, config.document());
        assert_eq!(reloaded["nodeSelector"]["kubernetes.io/os"], "linux");
        assert_eq!(reloaded["iterations"], 250);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, paths::SHARED_FILE_MODE);
        }

        config.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_dropping_deletes_file() {
        let config = ConfigMaterializer::new()
            .materialize(None, "/app/kubeconfig")
            .unwrap();
        let path = config.path().to_path_buf();
        assert!(path.exists());
        drop(config);
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_base_file() {
        let err = ConfigMaterializer::new()
            .materialize(Some(Path::new("/nonexistent/config.yaml")), "/app/kubeconfig")
            .unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }
}
