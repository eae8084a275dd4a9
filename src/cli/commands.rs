//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{DeployArgs, StatusArgs, UninstallArgs};
use crate::config::{ConfigError, Settings};
use crate::deploy::{
    decide, DeployError, DeploymentReconciler, DeploymentReport, DeploymentRequest, LogSession,
    LogSink, ReconciliationDecision, RequestError, SessionReport, SigningKeys,
};
use crate::kube::{ClusterApi, ClusterError};
use crate::module::{ClusterModuleState, UnloadReport};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("{0}")]
    Deploy(#[from] DeployError),

    #[error("Unknown node(s): {0}")]
    UnknownNodes(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Deploy Commands
// ============================================================================

/// Read a manifest template from disk
pub fn load_manifest(path: &Path) -> CommandResult<String> {
    std::fs::read_to_string(path).map_err(|source| CommandError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a manifest template and fill it from `request`
///
/// Deploy and uninstall both go through here so they address the same
/// resources.
pub fn render_manifest_file(path: &Path, request: &DeploymentRequest) -> CommandResult<String> {
    Ok(request.render_manifest(&load_manifest(path)?))
}

/// Build the immutable request from command line arguments
pub fn build_request(args: &DeployArgs) -> DeploymentRequest {
    let mut request = DeploymentRequest::new(&args.target_version, &args.namespace, &args.image)
        .prebuilt(args.prebuilt);
    if let Some(secret) = &args.pull_secret {
        request = request.with_pull_secret(secret);
    }
    if let (Some(key), Some(cert)) = (&args.signing_key, &args.signing_cert) {
        request = request.with_signing(SigningKeys::new(key, cert));
    }
    request
}

/// What a deploy would do
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub state: ClusterModuleState,
    pub decision: ReconciliationDecision,
}

/// Inspect the cluster and decide, without changing anything
pub async fn plan_deploy(
    api: Arc<dyn ClusterApi>,
    settings: &Settings,
    request: &DeploymentRequest,
    fast_path: bool,
) -> CommandResult<DeployPlan> {
    request.check_local_preconditions()?;
    let options = settings.reconciler_options();
    let reconciler = DeploymentReconciler::new(api, options.clone());
    let state = reconciler.aggregator().aggregate().await?;
    let decision = decide(
        &state,
        &request.target_version,
        fast_path || options.fast_path_when_current,
    );
    Ok(DeployPlan { state, decision })
}

/// Run the full reconciliation
pub async fn run_deploy(
    api: Arc<dyn ClusterApi>,
    settings: &Settings,
    args: &DeployArgs,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
) -> CommandResult<DeploymentReport> {
    let request = build_request(args);
    let manifest = render_manifest_file(&args.manifest, &request)?;

    let mut options = settings.reconciler_options();
    options.fast_path_when_current |= args.fast_path;

    let report = DeploymentReconciler::new(api, options)
        .with_sink(sink)
        .reconcile(&request, &manifest, cancel)
        .await?;
    Ok(report)
}

// ============================================================================
// Status Commands
// ============================================================================

/// Cluster state plus the optional version check
#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub state: ClusterModuleState,
    /// `(version, all nodes match)` when `--expect` was given
    pub expectation: Option<(String, bool)>,
}

pub async fn run_status(
    api: Arc<dyn ClusterApi>,
    settings: &Settings,
    args: &StatusArgs,
) -> CommandResult<StatusSummary> {
    let reconciler = DeploymentReconciler::new(api, settings.reconciler_options());
    let state = reconciler.aggregator().aggregate().await?;
    let expectation = args
        .expect
        .as_ref()
        .map(|version| (version.clone(), state.all_versions_match(version)));
    Ok(StatusSummary { state, expectation })
}

// ============================================================================
// Unload / Uninstall Commands
// ============================================================================

/// Resolve the nodes to act on: all Ready nodes, or the named ones
async fn resolve_nodes(api: &dyn ClusterApi, requested: &[String]) -> CommandResult<Vec<String>> {
    let nodes = api.list_nodes().await?;
    if requested.is_empty() {
        return Ok(nodes
            .into_iter()
            .filter(|n| {
                if !n.reachable {
                    warn!("Skipping node {}: not Ready", n.name);
                }
                n.reachable
            })
            .map(|n| n.name)
            .collect());
    }

    let unknown: Vec<&str> = requested
        .iter()
        .filter(|r| !nodes.iter().any(|n| &n.name == *r))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(CommandError::UnknownNodes(unknown.join(", ")));
    }
    Ok(requested.to_vec())
}

/// Unload the NFS stack on the given nodes, or every Ready node
pub async fn run_unload(
    api: Arc<dyn ClusterApi>,
    settings: &Settings,
    nodes: &[String],
) -> CommandResult<Vec<UnloadReport>> {
    let targets = resolve_nodes(api.as_ref(), nodes).await?;
    info!("Unloading on {} node(s)", targets.len());
    let reconciler = DeploymentReconciler::new(api, settings.reconciler_options());
    Ok(reconciler.sequencer().run_all(&targets).await)
}

/// Outcome of an uninstall
#[derive(Debug, Clone)]
pub struct UninstallReport {
    /// Error from deleting the workload, if any
    pub delete_error: Option<String>,
    pub unload_reports: Vec<UnloadReport>,
}

/// The request a workload was deployed with, as far as rendering goes
pub fn build_uninstall_request(args: &UninstallArgs) -> DeploymentRequest {
    let request = DeploymentRequest::new(&args.target_version, &args.namespace, &args.image);
    match &args.pull_secret {
        Some(secret) => request.with_pull_secret(secret),
        None => request,
    }
}

/// Delete the workload, then unload every Ready node
///
/// A failed delete is reported but does not stop the unload.
pub async fn run_uninstall(
    api: Arc<dyn ClusterApi>,
    settings: &Settings,
    args: &UninstallArgs,
) -> CommandResult<UninstallReport> {
    let request = build_uninstall_request(args);
    request.validate()?;
    let namespace = request.namespace.as_str();
    let rendered = render_manifest_file(&args.manifest, &request)?;

    let delete_error = match api.delete(&rendered).await {
        Ok(()) => {
            info!("Deleted workload in {}", namespace);
            None
        }
        Err(e) => {
            warn!("Deleting workload failed, unloading anyway: {}", e);
            Some(e.to_string())
        }
    };

    let unload_reports = run_unload(api, settings, &[]).await?;
    Ok(UninstallReport {
        delete_error,
        unload_reports,
    })
}

// ============================================================================
// Logs Commands
// ============================================================================

/// Follow every current worker until they finish or `cancel` fires
pub async fn run_logs(
    api: Arc<dyn ClusterApi>,
    settings: &Settings,
    namespace: &str,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
) -> CommandResult<SessionReport> {
    let workers: Vec<String> = api
        .list_workers(namespace, &settings.worker_selector)
        .await?
        .into_iter()
        .map(|w| w.name)
        .collect();
    if workers.is_empty() {
        info!("No workers in {}", namespace);
        return Ok(SessionReport::default());
    }

    let reconciler = DeploymentReconciler::new(api, settings.reconciler_options()).with_sink(sink);
    let session = Arc::new(LogSession::new(cancel));
    Ok(reconciler.supervisor(namespace).stream(&workers, session).await)
}
