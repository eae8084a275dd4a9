//! GracefulUnloadSequencer - ordered teardown of the NFS stack on a node
//!
//! The sequence is fixed:
//! 1. Unmount NFS filesystems (v4 and v3)
//! 2. Stop dependent RPC services, leaving `rpcbind.socket` alone
//! 3. Unmount `rpc_pipefs` where mounted
//! 4. Remove kernel modules, most dependent first, flushing caches and
//!    pausing before the base transport module
//!
//! Every step is guarded so that a node with nothing loaded is a no-op.
//! A failed step is recorded as a warning and the sequence carries on.
//!
//! Steps run in two batches per node, each a single exec: everything up to
//! the cache flush, then the base module after the drain pause. Each step
//! in a batch brackets its output with status markers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::kube::{ClusterApi, ExecOutput};

/// NFS filesystem types unmounted in step 1, newest protocol first
pub const NFS_MOUNT_TYPES: [&str; 2] = ["nfs4", "nfs"];

/// Service units stopped in step 2, in order
pub const SERVICE_UNITS: [&str; 5] = [
    "nfs-server.service",
    "rpc-gssd.service",
    "rpc-statd.service",
    "nfs-idmapd.service",
    "rpcbind.service",
];

/// Socket unit that must stay up even though its service is stopped
pub const PRESERVED_SOCKET_UNIT: &str = "rpcbind.socket";

/// Known `rpc_pipefs` mount points
pub const PIPEFS_MOUNT_POINTS: [&str; 2] = ["/var/lib/nfs/rpc_pipefs", "/run/rpc_pipefs"];

/// Modules in reverse dependency order, ending with the base transport
pub const MANAGED_MODULES: [&str; 10] = [
    "nfsv4",
    "nfsv3",
    "nfs",
    "nfs_acl",
    "lockd",
    "compat_nfs_ssc",
    "rpcsec_gss_krb5",
    "auth_rpcgss",
    "rpcrdma",
    "sunrpc",
];

/// The module every other managed module depends on
pub const BASE_TRANSPORT_MODULE: &str = "sunrpc";

/// Printed by the flush step when it actually flushed
const FLUSHED_MARKER: &str = "flushed";

/// Prefix of the per-step lines in a batch script's output
pub const STEP_MARKER: &str = "__vastnfs_step=";

/// A single teardown action on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum UnloadStep {
    UnmountFilesystems { fs_type: String },
    StopService { unit: String },
    UnmountPipefs { mount_point: String },
    FlushCaches,
    RemoveModule { module: String },
}

impl UnloadStep {
    /// Shell script that performs this step on the host
    pub fn script(&self) -> String {
        match self {
            Self::UnmountFilesystems { fs_type } => format!("umount -a -t {}", fs_type),
            Self::StopService { unit } => format!(
                "if systemctl is-active --quiet {unit}; then systemctl stop {unit}; fi"
            ),
            Self::UnmountPipefs { mount_point } => format!(
                "if mountpoint -q {mp}; then umount {mp}; fi",
                mp = mount_point
            ),
            Self::FlushCaches => format!(
                "if [ -d /sys/module/{m} ]; then sync; echo 3 > /proc/sys/vm/drop_caches; echo {f}; fi",
                m = BASE_TRANSPORT_MODULE,
                f = FLUSHED_MARKER
            ),
            Self::RemoveModule { module } => format!(
                "if [ -d /sys/module/{module} ]; then rmmod {module}; fi"
            ),
        }
    }

    /// Whether the step's result counts as success
    pub fn succeeded(&self, out: &ExecOutput) -> bool {
        match self {
            Self::UnmountFilesystems { .. } => {
                out.success() || out.output.contains("not mounted")
            }
            _ => out.success(),
        }
    }
}

impl fmt::Display for UnloadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmountFilesystems { fs_type } => write!(f, "unmount {} filesystems", fs_type),
            Self::StopService { unit } => write!(f, "stop {}", unit),
            Self::UnmountPipefs { mount_point } => write!(f, "unmount {}", mount_point),
            Self::FlushCaches => write!(f, "flush kernel caches"),
            Self::RemoveModule { module } => write!(f, "remove module {}", module),
        }
    }
}

/// The full ordered plan
pub fn unload_plan() -> Vec<UnloadStep> {
    let mut plan = Vec::new();

    for fs_type in NFS_MOUNT_TYPES {
        plan.push(UnloadStep::UnmountFilesystems {
            fs_type: fs_type.to_string(),
        });
    }

    for unit in SERVICE_UNITS {
        plan.push(UnloadStep::StopService {
            unit: unit.to_string(),
        });
    }

    for mount_point in PIPEFS_MOUNT_POINTS {
        plan.push(UnloadStep::UnmountPipefs {
            mount_point: mount_point.to_string(),
        });
    }

    for module in MANAGED_MODULES {
        if module == BASE_TRANSPORT_MODULE {
            plan.push(UnloadStep::FlushCaches);
        }
        plan.push(UnloadStep::RemoveModule {
            module: module.to_string(),
        });
    }

    plan
}

/// One script running `steps` in order, reporting each one's status
///
/// Step `i` prints `__vastnfs_step=<i>:begin`, its combined output, then
/// `__vastnfs_step=<i>:<status>`. A failing step does not stop the batch.
pub fn batch_script(steps: &[UnloadStep]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            format!(
                "echo {m}{i}:begin; {{ {script}; }} 2>&1; echo {m}{i}:$?",
                m = STEP_MARKER,
                i = i,
                script = step.script()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a batch's output into per-step results
///
/// Returns one entry per step; `None` where the step never reported a status,
/// e.g. because the exec pod died partway through.
pub fn parse_batch_output(output: &str, steps: usize) -> Vec<Option<ExecOutput>> {
    let mut results: Vec<Option<ExecOutput>> = vec![None; steps];
    let mut current: Option<(usize, Vec<&str>)> = None;

    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix(STEP_MARKER) else {
            if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            }
            continue;
        };
        let Some((index, tail)) = rest.split_once(':') else {
            continue;
        };
        let Ok(index) = index.parse::<usize>() else {
            continue;
        };
        if index >= steps {
            continue;
        }

        if tail == "begin" {
            current = Some((index, Vec::new()));
            continue;
        }
        let Ok(status) = tail.parse::<i32>() else {
            continue;
        };
        let lines = match current.take() {
            Some((i, lines)) if i == index => lines,
            _ => Vec::new(),
        };
        results[index] = Some(ExecOutput {
            output: lines.join("\n"),
            status,
        });
    }

    results
}

/// A step that failed on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub node: String,
    pub step: UnloadStep,
    pub reason: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} failed: {}", self.node, self.step, self.reason)
    }
}

/// Outcome of the sequence on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnloadReport {
    pub node: String,
    pub steps_run: usize,
    pub warnings: Vec<StepFailure>,
}

impl UnloadReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Runs the teardown sequence on nodes
#[derive(Clone)]
pub struct GracefulUnloadSequencer {
    api: Arc<dyn ClusterApi>,
    drain_pause: Duration,
    max_parallel_nodes: usize,
}

impl GracefulUnloadSequencer {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            drain_pause: Duration::from_secs(2),
            max_parallel_nodes: 8,
        }
    }

    /// Pause between the cache flush and removing the base module
    pub fn with_drain_pause(mut self, pause: Duration) -> Self {
        self.drain_pause = pause;
        self
    }

    pub fn with_max_parallel_nodes(mut self, limit: usize) -> Self {
        self.max_parallel_nodes = limit.max(1);
        self
    }

    /// Run the full sequence on one node. Never fails; problems are warnings.
    pub async fn run(&self, node: &str) -> UnloadReport {
        let plan = unload_plan();
        let mut warnings = Vec::new();

        info!("Unloading NFS stack on {}", node);

        let split = plan
            .iter()
            .position(|s| *s == UnloadStep::FlushCaches)
            .map_or(plan.len(), |i| i + 1);
        let (teardown, base) = plan.split_at(split);

        for batch in [teardown, base] {
            if batch.is_empty() {
                continue;
            }

            let mut flushed = false;
            for (step, result) in batch.iter().zip(self.run_batch(node, batch).await) {
                let reason = match result {
                    Ok(out) if step.succeeded(&out) => {
                        debug!("{}: {} ok", node, step);
                        if *step == UnloadStep::FlushCaches && out.output.contains(FLUSHED_MARKER) {
                            flushed = true;
                        }
                        continue;
                    }
                    Ok(out) => format!("exit status {}: {}", out.status, out.output.trim()),
                    Err(reason) => reason,
                };

                warn!("{}: {} failed, continuing: {}", node, step, reason);
                warnings.push(StepFailure {
                    node: node.to_string(),
                    step: step.clone(),
                    reason,
                });
            }

            if flushed {
                // Let remaining references to the transport drain
                sleep(self.drain_pause).await;
            }
        }

        if warnings.is_empty() {
            info!("Unload on {} completed cleanly", node);
        } else {
            warn!("Unload on {} completed with {} warning(s)", node, warnings.len());
        }

        UnloadReport {
            node: node.to_string(),
            steps_run: plan.len(),
            warnings,
        }
    }

    /// Run `steps` as one exec, one result per step
    async fn run_batch(&self, node: &str, steps: &[UnloadStep]) -> Vec<Result<ExecOutput, String>> {
        match self.api.exec_on_node(node, &batch_script(steps)).await {
            Ok(out) => parse_batch_output(&out.output, steps.len())
                .into_iter()
                .map(|r| r.ok_or_else(|| "no status reported".to_string()))
                .collect(),
            Err(e) => {
                let reason = e.to_string();
                steps.iter().map(|_| Err(reason.clone())).collect()
            }
        }
    }

    /// Run the sequence on every node, nodes in parallel
    ///
    /// Returns once every node has finished, reports sorted by node name.
    pub async fn run_all(&self, nodes: &[String]) -> Vec<UnloadReport> {
        let mut reports: Vec<UnloadReport> = futures::stream::iter(nodes.iter().cloned())
            .map(|node| {
                let sequencer = self.clone();
                async move { sequencer.run(&node).await }
            })
            .buffer_unordered(self.max_parallel_nodes)
            .collect()
            .await;

        reports.sort_by(|a, b| a.node.cmp(&b.node));
        reports
    }
}
