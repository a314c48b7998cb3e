//! Error types for the harness
//!
//! Errors fall into the classes a test session has to tell apart: the
//! container engine failing, a setup stage never becoming ready, a command
//! inside a container exiting non-zero, and the workload producing a report
//! that does not hold up. Every message carries the captured output that
//! explains it.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Container Runtime Errors ===
    #[error("Container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("Container '{0}' not found")]
    ContainerNotFound(String),

    #[error("Image '{0}' not found")]
    ImageNotFound(String),

    #[error("Container '{container}' failed with exit code {exit_code}{}\n--- container logs ---\n{logs}", error.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    ContainerFailed {
        container: String,
        exit_code: i64,
        error: Option<String>,
        logs: String,
    },

    // === Setup Readiness Errors ===
    #[error("Timed out waiting for {stage} after {attempts} attempts. Last failure: {last_failure}")]
    SetupTimeout {
        stage: String,
        attempts: u32,
        last_failure: String,
    },

    // === Command Errors ===
    #[error("Command `{command}` exited with code {exit_code}\n--- output ---\n{output}")]
    CommandFailed {
        command: String,
        exit_code: i64,
        output: String,
    },

    // === Report Validation Errors ===
    #[error("Test report failed validation:\n  - {}", violations.join("\n  - "))]
    ReportInvalid { violations: Vec<String> },

    #[error("Failed to parse test report '{path}': {error}")]
    ReportParse { path: String, error: String },

    #[error("Workload probe of {endpoint} failed: {reason}")]
    WorkloadProbe { endpoint: String, reason: String },

    // === Lifecycle Errors ===
    #[error("Cannot {action} while cluster is {state}")]
    InvalidState { action: String, state: String },

    #[error("Teardown left resources behind:\n  - {}", failures.join("\n  - "))]
    Teardown { failures: Vec<String> },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Engine unreachable, image missing, container crashed
    Runtime,
    /// A bounded readiness poll ran out of attempts
    SetupTimeout,
    /// A command inside a container exited non-zero
    CommandExit,
    /// The workload misbehaved; the harness itself is fine
    ReportValidation,
    /// Best-effort teardown could not release everything
    Teardown,
    /// Configuration, IO, serialization or lifecycle misuse
    Other,
}

impl Error {
    /// Create a command failed error from captured output
    pub fn command_failed(command: &str, exit_code: i64, output: &str) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            exit_code,
            output: output.to_string(),
        }
    }

    /// Create a setup timeout error
    pub fn setup_timeout(stage: &str, attempts: u32, last_failure: Option<String>) -> Self {
        Self::SetupTimeout {
            stage: stage.to_string(),
            attempts,
            last_failure: last_failure.unwrap_or_else(|| "none recorded".to_string()),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a workload probe error
    pub fn probe_failed(endpoint: &str, reason: impl Into<String>) -> Self {
        Self::WorkloadProbe {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    /// Which failure class this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Runtime(_)
            | Error::ContainerNotFound(_)
            | Error::ImageNotFound(_)
            | Error::ContainerFailed { .. } => ErrorKind::Runtime,
            Error::SetupTimeout { .. } => ErrorKind::SetupTimeout,
            Error::CommandFailed { .. } => ErrorKind::CommandExit,
            Error::ReportInvalid { .. } | Error::ReportParse { .. } | Error::WorkloadProbe { .. } => {
                ErrorKind::ReportValidation
            }
            Error::Teardown { .. } => ErrorKind::Teardown,
            _ => ErrorKind::Other,
        }
    }

    /// True when the harness broke before the workload could be judged
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Runtime | ErrorKind::SetupTimeout | ErrorKind::CommandExit
        )
    }

    /// True for a 404 from the container engine
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ContainerNotFound(_) | Error::ImageNotFound(_) => true,
            Error::Runtime(e) => is_engine_status(e, 404),
            _ => false,
        }
    }
}

/// Check whether an engine error is a server response with the given status
pub(crate) fn is_engine_status(error: &bollard::errors::Error, status: u16) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == status
    )
}
