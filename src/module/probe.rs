//! NodeStateProbe - read-only inspection of a single node

use thiserror::Error;
use tracing::{debug, warn};

use super::state::{parse_probe_output, ModuleState, ParseError, PROBE_SCRIPT};
use crate::kube::{ClusterApi, ClusterError};

/// Why a node could not be inspected
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("inspection channel failed: {0}")]
    Unreachable(#[from] ClusterError),

    #[error("probe script exited with status {status}: {output}")]
    ScriptFailed { status: i32, output: String },

    #[error("unrecognised probe output: {0}")]
    Malformed(#[from] ParseError),
}

/// Inspect one node. Never mutates node state.
pub async fn probe_node(api: &dyn ClusterApi, node: &str) -> Result<ModuleState, ProbeError> {
    let out = api.exec_on_node(node, PROBE_SCRIPT).await?;
    if !out.success() {
        return Err(ProbeError::ScriptFailed {
            status: out.status,
            output: out.output.trim().to_string(),
        });
    }

    let state = parse_probe_output(&out.output)?;
    debug!(
        "Probed {}: loaded={} version={}",
        node,
        state.loaded,
        state.display_version()
    );
    Ok(state)
}

/// Inspect one node, treating any inspection failure as "not loaded"
///
/// The failure is returned alongside so the caller can report it.
pub async fn probe_node_lenient(
    api: &dyn ClusterApi,
    node: &str,
) -> (ModuleState, Option<ProbeError>) {
    match probe_node(api, node).await {
        Ok(state) => (state, None),
        Err(e) => {
            warn!("Probe of node {} failed, treating as not loaded: {}", node, e);
            (ModuleState::not_loaded(), Some(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::mock::{FakeCluster, FakeNode};

    #[tokio::test]
    async fn test_probe_loaded_node() {
        let cluster = FakeCluster::new().with_node("node-a", FakeNode::loaded("4.0.35"));
        let state = probe_node(&cluster, "node-a").await.unwrap();
        assert_eq!(state, ModuleState::loaded("4.0.35"));
        // Probing is read-only
        assert!(cluster.node_modules("node-a").contains(&"sunrpc".to_string()));
    }

    #[tokio::test]
    async fn test_probe_empty_node() {
        let cluster = FakeCluster::new().with_node("node-b", FakeNode::empty());
        let state = probe_node(&cluster, "node-b").await.unwrap();
        assert!(!state.loaded);
    }

    #[tokio::test]
    async fn test_probe_unreachable_node() {
        let cluster = FakeCluster::new().with_node("node-c", FakeNode::empty().unreachable());
        let err = probe_node(&cluster, "node-c").await.unwrap_err();
        assert!(matches!(err, ProbeError::Unreachable(_)));

        let (state, failure) = probe_node_lenient(&cluster, "node-c").await;
        assert!(!state.loaded);
        assert!(failure.is_some());
    }

    #[tokio::test]
    async fn test_probe_garbage_output() {
        let cluster = FakeCluster::new().with_node(
            "node-d",
            FakeNode::empty().with_probe_output("nsenter: cannot open /proc/1/ns/ipc"),
        );
        let (state, failure) = probe_node_lenient(&cluster, "node-d").await;
        assert!(!state.loaded);
        assert!(matches!(failure, Some(ProbeError::Malformed(_))));
    }
}
