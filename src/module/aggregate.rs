//! ClusterStateAggregator - fans the probe out over every node
//!
//! Probes run on a bounded pool: a [`Semaphore`] caps how many remote
//! inspections are in flight while a [`JoinSet`] owns the tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::probe::probe_node_lenient;
use super::state::ModuleState;
use crate::kube::{ClusterApi, ClusterError, Node};

/// Default number of simultaneous node probes
pub const DEFAULT_PROBE_CONCURRENCY: usize = 8;

/// A node that could not be inspected; counted as not loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeFailure {
    pub node: String,
    pub reason: String,
}

/// State of one node within an aggregation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeModuleState {
    pub reachable: bool,
    pub module: ModuleState,
}

/// Cluster-wide module view for one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterModuleState {
    /// Per-node state keyed by node name
    pub nodes: BTreeMap<String, NodeModuleState>,
    /// Nodes whose inspection failed, sorted by node name
    pub probe_failures: Vec<ProbeFailure>,
}

impl ClusterModuleState {
    /// Nodes with the module loaded
    pub fn active_count(&self) -> usize {
        self.nodes.values().filter(|n| n.module.loaded).count()
    }

    pub fn total_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every node is loaded and reports exactly `target`
    pub fn all_versions_match(&self, target: &str) -> bool {
        !self.nodes.is_empty() && self.nodes.values().all(|n| n.module.matches_version(target))
    }

    pub fn any_loaded(&self) -> bool {
        self.active_count() > 0
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn loaded_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.module.loaded)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Insert one node result; failures are kept sorted
    pub fn record(&mut self, node: Node, module: ModuleState, failure: Option<String>) {
        if let Some(reason) = failure {
            self.probe_failures.push(ProbeFailure {
                node: node.name.clone(),
                reason,
            });
            self.probe_failures.sort_by(|a, b| a.node.cmp(&b.node));
        }
        self.nodes.insert(
            node.name,
            NodeModuleState {
                reachable: node.reachable,
                module,
            },
        );
    }
}

/// Probes every node with capped concurrency
#[derive(Clone)]
pub struct ClusterStateAggregator {
    api: Arc<dyn ClusterApi>,
    max_concurrent: usize,
}

impl ClusterStateAggregator {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            max_concurrent: DEFAULT_PROBE_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrent = limit.max(1);
        self
    }

    /// Enumerate nodes fresh and probe them all
    ///
    /// Fails only when the node list itself cannot be obtained.
    pub async fn aggregate(&self) -> Result<ClusterModuleState, ClusterError> {
        let nodes = self.api.list_nodes().await?;
        Ok(self.aggregate_nodes(nodes).await)
    }

    /// Probe the given nodes; never fails
    pub async fn aggregate_nodes(&self, nodes: Vec<Node>) -> ClusterModuleState {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set = JoinSet::new();
        let mut state = ClusterModuleState::default();

        debug!(
            "Probing {} nodes, at most {} at a time",
            nodes.len(),
            self.max_concurrent
        );

        for node in &nodes {
            if !node.reachable {
                warn!("Node {} is not Ready, treating as not loaded", node.name);
                state.record(
                    node.clone(),
                    ModuleState::not_loaded(),
                    Some("node is not Ready".to_string()),
                );
                continue;
            }

            let api = Arc::clone(&self.api);
            let semaphore = Arc::clone(&semaphore);
            let node = node.clone();
            set.spawn(async move {
                // Held until the probe finishes
                let _permit = semaphore.acquire_owned().await;
                let (module, failure) = probe_node_lenient(api.as_ref(), &node.name).await;
                (node, module, failure.map(|e| e.to_string()))
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((node, module, failure)) => state.record(node, module, failure),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        // A probe task that died still counts as a node
        for node in nodes {
            if !state.nodes.contains_key(&node.name) {
                state.record(
                    node,
                    ModuleState::not_loaded(),
                    Some("probe task aborted".to_string()),
                );
            }
        }

        info!(
            "Module active on {}/{} nodes",
            state.active_count(),
            state.total_count()
        );
        state
    }
}
