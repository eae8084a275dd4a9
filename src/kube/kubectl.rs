//! `kubectl`-backed implementation of [`ClusterApi`]
//!
//! Argument vectors and output parsing are pure functions so they can be
//! tested without a cluster. The [`Kubectl`] type is the thin I/O layer that
//! spawns the binary.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, trace, warn};

use super::{ClusterApi, ClusterError, ExecOutput, LogStream, Node, SecretFile, WorkerPhase, WorkerPod};

/// Marker printed after every remote script so the script status survives
/// the trip through `kubectl run`
pub const EXIT_MARKER: &str = "__vastnfs_exit=";

/// Settings for invoking kubectl
#[derive(Debug, Clone)]
pub struct KubectlConfig {
    /// Path or name of the kubectl binary
    pub binary: String,
    /// kubeconfig context to use (current context if unset)
    pub context: Option<String>,
    /// Explicit kubeconfig path
    pub kubeconfig: Option<String>,
    /// Image for the short-lived node shell pods
    pub exec_image: String,
    /// Namespace the node shell pods are created in
    pub exec_namespace: String,
    /// Upper bound for any single non-streaming kubectl call
    pub timeout: Duration,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_string(),
            context: None,
            kubeconfig: None,
            exec_image: "busybox:1.36".to_string(),
            exec_namespace: "default".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

// ============================================================================
// SBIO: Pure argument generation (no I/O)
// ============================================================================

/// Global flags that select the cluster
pub fn global_args(config: &KubectlConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(kubeconfig) = &config.kubeconfig {
        args.push("--kubeconfig".to_string());
        args.push(kubeconfig.clone());
    }
    if let Some(context) = &config.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    args
}

pub fn get_nodes_args() -> Vec<String> {
    vec!["get".to_string(), "nodes".to_string(), "-o".to_string(), "json".to_string()]
}

/// Wrap a script so that its exit status is printed as the last line
pub fn wrap_remote_script(script: &str) -> String {
    format!("{{ {}\n}} 2>&1; echo \"{}$?\"", script.trim_end(), EXIT_MARKER)
}

/// Name for a node shell pod; must be a valid DNS label
pub fn exec_pod_name(node: &str, suffix: &str) -> String {
    let sanitized: String = node
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut name = format!("vastnfs-exec-{}", sanitized.trim_matches('-'));
    // 63 chars max, leave room for "-" and the suffix
    name.truncate(63 - suffix.len() - 1);
    format!("{}-{}", name.trim_end_matches('-'), suffix)
}

/// Arguments that run `script` in the host namespaces of `node`
pub fn node_exec_args(config: &KubectlConfig, node: &str, pod_name: &str, script: &str) -> Vec<String> {
    let overrides = json!({
        "apiVersion": "v1",
        "spec": {
            "nodeName": node,
            "hostPID": true,
            "hostNetwork": true,
            "tolerations": [{ "operator": "Exists" }],
            "containers": [{
                "name": "shell",
                "image": config.exec_image,
                "stdin": true,
                "command": [
                    "nsenter", "-t", "1", "-m", "-u", "-i", "-n", "-p", "--",
                    "sh", "-c", wrap_remote_script(script)
                ],
                "securityContext": { "privileged": true }
            }]
        }
    });

    vec![
        "run".to_string(),
        pod_name.to_string(),
        "-n".to_string(),
        config.exec_namespace.clone(),
        format!("--image={}", config.exec_image),
        "--restart=Never".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--quiet".to_string(),
        format!("--pod-running-timeout={}s", config.timeout.as_secs().max(1)),
        format!("--overrides={}", overrides),
    ]
}

/// Removes a node shell pod that `--rm` did not get to clean up
pub fn delete_pod_args(namespace: &str, pod_name: &str) -> Vec<String> {
    vec![
        "delete".to_string(),
        "pod".to_string(),
        pod_name.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--ignore-not-found".to_string(),
        "--wait=false".to_string(),
    ]
}

pub fn apply_args() -> Vec<String> {
    vec!["apply".to_string(), "-f".to_string(), "-".to_string()]
}

pub fn delete_args() -> Vec<String> {
    vec![
        "delete".to_string(),
        "-f".to_string(),
        "-".to_string(),
        "--ignore-not-found".to_string(),
    ]
}

pub fn get_pods_args(namespace: &str, selector: &str) -> Vec<String> {
    vec![
        "get".to_string(),
        "pods".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "-l".to_string(),
        selector.to_string(),
        "-o".to_string(),
        "json".to_string(),
    ]
}

pub fn logs_args(namespace: &str, worker: &str, follow: bool) -> Vec<String> {
    let mut args = vec![
        "logs".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        worker.to_string(),
    ];
    if follow {
        args.push("-f".to_string());
    }
    args
}

pub fn secret_exists_args(namespace: &str, name: &str) -> Vec<String> {
    vec![
        "get".to_string(),
        "secret".to_string(),
        name.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--ignore-not-found".to_string(),
        "-o".to_string(),
        "name".to_string(),
    ]
}

/// Prints the decoded value of `key`, or nothing when the key is absent
pub fn secret_key_args(namespace: &str, name: &str, key: &str) -> Vec<String> {
    vec![
        "get".to_string(),
        "secret".to_string(),
        name.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "-o".to_string(),
        format!(
            "go-template={{{{with index .data \"{}\"}}}}{{{{. | base64decode}}}}{{{{end}}}}",
            key
        ),
    ]
}

/// Renders a generic secret as YAML without touching the cluster
pub fn render_secret_args(namespace: &str, name: &str, files: &[SecretFile]) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "secret".to_string(),
        "generic".to_string(),
        name.to_string(),
        "-n".to_string(),
        namespace.to_string(),
    ];
    for file in files {
        args.push(format!("--from-file={}={}", file.key, file.path.display()));
    }
    args.push("--dry-run=client".to_string());
    args.push("-o".to_string());
    args.push("yaml".to_string());
    args
}

// ============================================================================
// SBIO: Pure output parsing (no I/O)
// ============================================================================

#[derive(Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Deserialize)]
struct NodeItem {
    metadata: ObjectMeta,
    #[serde(default)]
    status: NodeItemStatus,
}

#[derive(Deserialize, Default)]
struct NodeItemStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

#[derive(Deserialize)]
struct PodItem {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize, Default)]
struct PodSpec {
    #[serde(rename = "nodeName")]
    node_name: Option<String>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    phase: Option<String>,
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    ready: bool,
}

/// Parse `kubectl get nodes -o json`
pub fn parse_node_list(json: &str) -> Result<Vec<Node>, ClusterError> {
    let list: ItemList<NodeItem> =
        serde_json::from_str(json).map_err(|e| ClusterError::Parse(e.to_string()))?;

    Ok(list
        .items
        .into_iter()
        .map(|item| {
            let reachable = item
                .status
                .conditions
                .iter()
                .any(|c| c.condition_type == "Ready" && c.status == "True");
            Node::new(item.metadata.name, reachable)
        })
        .collect())
}

/// Parse `kubectl get pods -o json`
pub fn parse_worker_list(json: &str) -> Result<Vec<WorkerPod>, ClusterError> {
    let list: ItemList<PodItem> =
        serde_json::from_str(json).map_err(|e| ClusterError::Parse(e.to_string()))?;

    Ok(list
        .items
        .into_iter()
        .map(|item| WorkerPod {
            name: item.metadata.name,
            node: item.spec.node_name,
            phase: item
                .status
                .phase
                .as_deref()
                .map(WorkerPhase::parse)
                .unwrap_or_default(),
            ready_containers: item
                .status
                .container_statuses
                .iter()
                .filter(|c| c.ready)
                .count() as u32,
        })
        .collect())
}

/// Split the exit marker off remote output
///
/// Returns `None` when the marker is missing, i.e. the script never finished.
pub fn split_exit_marker(output: &str) -> Option<ExecOutput> {
    let trimmed = output.trim_end();
    let (body, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    let status = last.trim().strip_prefix(EXIT_MARKER)?.parse::<i32>().ok()?;
    Some(ExecOutput {
        output: body.to_string(),
        status,
    })
}

// ============================================================================
// I/O implementation
// ============================================================================

/// Cluster access through the kubectl binary
#[derive(Debug, Clone)]
pub struct Kubectl {
    config: KubectlConfig,
}

impl Kubectl {
    pub fn new(config: KubectlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KubectlConfig {
        &self.config
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(global_args(&self.config))
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run kubectl to completion and return stdout
    async fn run(&self, args: Vec<String>, stdin: Option<&str>) -> Result<String, ClusterError> {
        let verb = args.first().cloned().unwrap_or_default();
        trace!("kubectl {}", args.join(" "));

        let mut cmd = self.command(&args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .map_err(|e| ClusterError::Spawn(format!("{}: {}", self.config.binary, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| ClusterError::Spawn(e.to_string()))?;
            // Close stdin so kubectl sees EOF
            drop(pipe);
        }

        let output = timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClusterError::Timeout(self.config.timeout.as_secs()))?
            .map_err(|e| ClusterError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(ClusterError::Command {
                command: verb,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn remove_exec_pod(&self, pod_name: &str) {
        let args = delete_pod_args(&self.config.exec_namespace, pod_name);
        match self.run(args, None).await {
            Ok(_) => debug!("Removed node shell {}", pod_name),
            Err(e) => warn!("Failed to remove node shell {}: {}", pod_name, e),
        }
    }
}

#[async_trait]
impl ClusterApi for Kubectl {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let json = self.run(get_nodes_args(), None).await?;
        parse_node_list(&json)
    }

    async fn exec_on_node(&self, node: &str, script: &str) -> Result<ExecOutput, ClusterError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let pod_name = exec_pod_name(node, &suffix[..8]);
        debug!("Running node shell {} on {}", pod_name, node);

        let result = match self
            .run(node_exec_args(&self.config, node, &pod_name, script), None)
            .await
        {
            Ok(stdout) => split_exit_marker(&stdout).ok_or_else(|| {
                ClusterError::NodeUnreachable(node.to_string(), "script did not complete".to_string())
            }),
            Err(e) => Err(ClusterError::NodeUnreachable(node.to_string(), e.to_string())),
        };

        // A killed or timed out `kubectl run` leaves its pod behind
        if result.is_err() {
            self.remove_exec_pod(&pod_name).await;
        }
        result
    }

    async fn apply(&self, manifest: &str) -> Result<(), ClusterError> {
        let out = self.run(apply_args(), Some(manifest)).await?;
        for line in out.lines() {
            debug!("apply: {}", line);
        }
        Ok(())
    }

    async fn delete(&self, manifest: &str) -> Result<(), ClusterError> {
        let out = self.run(delete_args(), Some(manifest)).await?;
        for line in out.lines() {
            debug!("delete: {}", line);
        }
        Ok(())
    }

    async fn list_workers(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<WorkerPod>, ClusterError> {
        let json = self.run(get_pods_args(namespace, selector), None).await?;
        parse_worker_list(&json)
    }

    async fn fetch_logs(&self, namespace: &str, worker: &str) -> Result<String, ClusterError> {
        self.run(logs_args(namespace, worker, false), None).await
    }

    async fn follow_logs(&self, namespace: &str, worker: &str) -> Result<LogStream, ClusterError> {
        let mut child = self
            .command(&logs_args(namespace, worker, true))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| ClusterError::Spawn(format!("{}: {}", self.config.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::Stream(worker.to_string(), "no stdout".to_string()))?;

        let name = worker.to_string();
        let lines = FramedRead::new(stdout, LinesCodec::new()).map({
            let name = name.clone();
            move |line| line.map_err(|e| ClusterError::Stream(name.clone(), e.to_string()))
        });

        // The child lives in the tail future; dropping the stream kills it
        let tail = futures::stream::once(async move {
            match child.wait_with_output().await {
                Ok(out) if out.status.success() => None,
                Ok(out) => Some(Err(ClusterError::Stream(
                    name,
                    String::from_utf8_lossy(&out.stderr).trim().to_string(),
                ))),
                Err(e) => Some(Err(ClusterError::Stream(name, e.to_string()))),
            }
        })
        .filter_map(futures::future::ready);

        Ok(lines.chain(tail).boxed())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let out = self.run(secret_exists_args(namespace, name), None).await?;
        Ok(!out.trim().is_empty())
    }

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, ClusterError> {
        let out = self.run(secret_key_args(namespace, name, key), None).await?;
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    async fn publish_secret(
        &self,
        namespace: &str,
        name: &str,
        files: &[SecretFile],
    ) -> Result<(), ClusterError> {
        let rendered = self.run(render_secret_args(namespace, name, files), None).await?;
        self.apply(&rendered).await
    }
}
