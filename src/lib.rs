//! kind perf harness - ephemeral cluster lifecycle and containerized test runs
//!
//! This library boots a disposable single-node kind cluster through the
//! local container engine, runs a load-test runner container against it and
//! validates the structured report the runner writes.

pub mod cli;
pub mod cluster;
pub mod commands;
pub mod common;
pub mod dns;
pub mod executor;
pub mod materialize;
pub mod poll;
pub mod runtime;
pub mod session;
pub mod workload;

// Re-export commonly used types for tests
pub use cluster::{ClusterOptions, ClusterPhase, KindCluster};
pub use common::{Error, ErrorKind, Result};
pub use executor::{RunnerOptions, TestReport, TestRunExecutor};
pub use materialize::{ConfigMaterializer, RunnerConfig};
pub use runtime::ContainerRuntime;
pub use session::Session;
