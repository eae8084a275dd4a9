//! Cluster access seam
//!
//! Everything the orchestrator needs from Kubernetes goes through the
//! [`ClusterApi`] trait:
//! - Node enumeration and remote execution on a node
//! - Declarative apply/delete of a rendered manifest
//! - Worker pod listing and log access
//! - Secret existence and content checks
//!
//! [`Kubectl`] is the production implementation. Tests use the scripted
//! `mock::FakeCluster`.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod kubectl;

#[cfg(test)]
pub mod mock;

pub use kubectl::{Kubectl, KubectlConfig};

/// Errors that can occur while talking to the cluster
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("Failed to run kubectl: {0}")]
    Spawn(String),

    #[error("kubectl {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Node '{0}' is unreachable: {1}")]
    NodeUnreachable(String, String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Failed to parse kubectl output: {0}")]
    Parse(String),

    #[error("Log stream for '{0}' failed: {1}")]
    Stream(String, String),
}

/// A cluster node as enumerated for one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Whether the node reports a `Ready=True` condition
    pub reachable: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, reachable: bool) -> Self {
        Self {
            name: name.into(),
            reachable,
        }
    }
}

/// Output of a script that ran on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Combined stdout/stderr
    pub output: String,
    /// Exit status of the script itself
    pub status: i32,
}

impl ExecOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            status: 0,
        }
    }

    pub fn failed(output: impl Into<String>, status: i32) -> Self {
        Self {
            output: output.into(),
            status,
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Pod phase as reported by the API server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkerPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkerPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// The pod will not run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A worker pod belonging to the deployed module workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPod {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub phase: WorkerPhase,
    /// Number of containers reporting `ready: true`
    pub ready_containers: u32,
}

impl WorkerPod {
    pub fn new(name: impl Into<String>, phase: WorkerPhase) -> Self {
        Self {
            name: name.into(),
            node: None,
            phase,
            ready_containers: 0,
        }
    }

    pub fn with_ready_containers(mut self, count: u32) -> Self {
        self.ready_containers = count;
        self
    }
}

/// A local file to publish as one entry of a generic secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFile {
    pub key: String,
    pub path: PathBuf,
}

/// Lines of a followed log; ends when the worker stops writing
pub type LogStream = BoxStream<'static, Result<String, ClusterError>>;

/// Everything the orchestrator needs from the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Enumerate all nodes, fresh from the API server
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// Run a shell script on a node's host namespaces
    ///
    /// `Err` means the script could not be run at all; a script that ran
    /// and failed is `Ok` with a non-zero status.
    async fn exec_on_node(&self, node: &str, script: &str) -> Result<ExecOutput, ClusterError>;

    /// Apply a fully rendered manifest
    async fn apply(&self, manifest: &str) -> Result<(), ClusterError>;

    /// Delete everything a rendered manifest describes
    async fn delete(&self, manifest: &str) -> Result<(), ClusterError>;

    /// List worker pods matching a label selector
    async fn list_workers(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<WorkerPod>, ClusterError>;

    /// Fetch the current logs of a worker without following
    async fn fetch_logs(&self, namespace: &str, worker: &str) -> Result<String, ClusterError>;

    /// Follow the logs of a worker from the beginning
    async fn follow_logs(&self, namespace: &str, worker: &str) -> Result<LogStream, ClusterError>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    /// Read one decoded data key of a secret; `None` when the key is absent
    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, ClusterError>;

    /// Create or update a generic secret from local files
    async fn publish_secret(
        &self,
        namespace: &str,
        name: &str,
        files: &[SecretFile],
    ) -> Result<(), ClusterError>;
}
