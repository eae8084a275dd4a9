//! DeploymentReconciler - drives one install or upgrade end to end
//!
//! ```text
//! Evaluating ──► Unloading ──► Applying ──► WaitingForReadiness ──► Streaming ──► Done
//!     │                           │
//!     └──► Applying (fresh)       └──► Failed
//! ```
//!
//! Only precondition and apply failures abort. Everything else becomes a
//! [`DeployWarning`] in the final [`DeploymentReport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::logs::{LogSession, LogSink, LogStreamSupervisor, RetryPolicy, StdoutSink};
use super::readiness::{wait_for_worker_ready, wait_for_workers, ReadinessTimings, WaitOutcome};
use super::request::{DeploymentRequest, RequestError};
use super::secrets::{check_pull_secret, publish_signing_keys, PullSecretProblem};
use crate::kube::{ClusterApi, ClusterError};
use crate::module::{
    ClusterModuleState, ClusterStateAggregator, GracefulUnloadSequencer, StepFailure, UnloadReport,
};

/// Fatal deployment errors; nothing after the failing step runs
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Apply failed: {0}")]
    Apply(String),

    #[error("Cannot enumerate cluster nodes: {0}")]
    NodeListing(ClusterError),
}

impl From<RequestError> for DeployError {
    fn from(e: RequestError) -> Self {
        DeployError::Precondition(e.to_string())
    }
}

/// Problems absorbed along the way
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeployWarning {
    ProbeFailure { node: String, reason: String },
    SequencerStep(StepFailure),
    ReadinessTimeout { what: String, waited: Duration },
    StreamRetryExhausted { worker: String, attempts: u32, last_error: String },
}

impl fmt::Display for DeployWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProbeFailure { node, reason } => {
                write!(f, "could not inspect {}: {}", node, reason)
            }
            Self::SequencerStep(failure) => write!(f, "unload {}", failure),
            Self::ReadinessTimeout { what, waited } => write!(
                f,
                "{} not ready after {}s; it may still finish, re-check with `status`",
                what,
                waited.as_secs()
            ),
            Self::StreamRetryExhausted {
                worker,
                attempts,
                last_error,
            } => write!(
                f,
                "no logs from {} after {} attempts: {}",
                worker, attempts, last_error
            ),
        }
    }
}

/// What to do given the cluster state and the requested version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconciliationDecision {
    Install,
    UpgradeViaUnloadThenInstall,
    NoOpAlreadyCurrent,
}

impl fmt::Display for ReconciliationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::UpgradeViaUnloadThenInstall => "unload then install",
            Self::NoOpAlreadyCurrent => "already current",
        };
        write!(f, "{}", s)
    }
}

/// Any detected load forces a full unload unless `fast_path` is set and
/// every node already runs `target`.
pub fn decide(state: &ClusterModuleState, target: &str, fast_path: bool) -> ReconciliationDecision {
    if fast_path && state.all_versions_match(target) {
        ReconciliationDecision::NoOpAlreadyCurrent
    } else if state.any_loaded() {
        ReconciliationDecision::UpgradeViaUnloadThenInstall
    } else {
        ReconciliationDecision::Install
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcilerState {
    Evaluating,
    Unloading,
    Applying,
    WaitingForReadiness,
    Streaming,
    Done,
    Failed,
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a successful run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeployOutcome {
    FreshInstall,
    AppliedCleanUnload,
    AppliedWithUnloadWarnings,
    AlreadyCurrent,
}

impl fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FreshInstall => "deployment applied (fresh install)",
            Self::AppliedCleanUnload => "deployment applied, unload performed cleanly",
            Self::AppliedWithUnloadWarnings => "deployment applied, unload reported warnings",
            Self::AlreadyCurrent => "nothing to do, every node already runs the target version",
        };
        write!(f, "{}", s)
    }
}

/// Summary of one reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub target_version: String,
    pub decision: ReconciliationDecision,
    pub outcome: DeployOutcome,
    /// Cluster state before anything changed
    pub initial_state: ClusterModuleState,
    pub unload_reports: Vec<UnloadReport>,
    /// Workers found after apply
    pub workers: Vec<String>,
    pub warnings: Vec<DeployWarning>,
    pub transitions: Vec<ReconcilerState>,
    /// Log streaming was interrupted
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeploymentReport {
    pub fn unload_warning_count(&self) -> usize {
        self.unload_reports.iter().map(|r| r.warnings.len()).sum()
    }
}

/// Tunables for a reconciler, usually built from settings
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub worker_selector: String,
    pub probe_concurrency: usize,
    pub drain_pause: Duration,
    pub timings: ReadinessTimings,
    pub retry: RetryPolicy,
    /// Skip the unload and apply when every node already runs the target
    pub fast_path_when_current: bool,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            worker_selector: "app.kubernetes.io/name=vastnfs".to_string(),
            probe_concurrency: crate::module::aggregate::DEFAULT_PROBE_CONCURRENCY,
            drain_pause: Duration::from_secs(2),
            timings: ReadinessTimings::default(),
            retry: RetryPolicy::default(),
            fast_path_when_current: false,
        }
    }
}

/// Drives the state machine for one request
pub struct DeploymentReconciler {
    api: Arc<dyn ClusterApi>,
    options: ReconcilerOptions,
    sink: Arc<dyn LogSink>,
}

/// Transition log of one run
struct Progress {
    transitions: Vec<ReconcilerState>,
}

impl Progress {
    fn enter(&mut self, state: ReconcilerState) {
        info!("Reconciler -> {}", state);
        self.transitions.push(state);
    }

    fn fail(&mut self, e: DeployError) -> DeployError {
        error!("Reconciler -> Failed: {}", e);
        self.transitions.push(ReconcilerState::Failed);
        e
    }
}

impl DeploymentReconciler {
    pub fn new(api: Arc<dyn ClusterApi>, options: ReconcilerOptions) -> Self {
        Self {
            api,
            options,
            sink: Arc::new(StdoutSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn aggregator(&self) -> ClusterStateAggregator {
        ClusterStateAggregator::new(Arc::clone(&self.api))
            .with_concurrency(self.options.probe_concurrency)
    }

    pub fn sequencer(&self) -> GracefulUnloadSequencer {
        GracefulUnloadSequencer::new(Arc::clone(&self.api))
            .with_drain_pause(self.options.drain_pause)
            .with_max_parallel_nodes(self.options.probe_concurrency)
    }

    pub fn supervisor(&self, namespace: &str) -> LogStreamSupervisor {
        LogStreamSupervisor::new(Arc::clone(&self.api), namespace)
            .with_policy(self.options.retry)
            .with_sink(Arc::clone(&self.sink))
    }

    /// Bring the cluster to `request.target_version` using `manifest`
    ///
    /// `cancel` interrupts the readiness wait and log streaming only; an
    /// unload in progress and the apply always run to completion.
    pub async fn reconcile(
        &self,
        request: &DeploymentRequest,
        manifest: &str,
        cancel: CancellationToken,
    ) -> Result<DeploymentReport, DeployError> {
        let started_at = Utc::now();
        let mut progress = Progress {
            transitions: Vec::new(),
        };
        let mut warnings = Vec::new();

        progress.enter(ReconcilerState::Evaluating);

        if let Err(e) = self.check_preconditions(request).await {
            return Err(progress.fail(e));
        }

        let state = match self.aggregator().aggregate().await {
            Ok(state) => state,
            Err(e) => return Err(progress.fail(DeployError::NodeListing(e))),
        };
        warnings.extend(state.probe_failures.iter().map(|f| DeployWarning::ProbeFailure {
            node: f.node.clone(),
            reason: f.reason.clone(),
        }));

        let decision = decide(
            &state,
            &request.target_version,
            self.options.fast_path_when_current,
        );
        info!(
            "Module active on {}/{} nodes, target {}: {}",
            state.active_count(),
            state.total_count(),
            request.target_version,
            decision
        );

        if decision == ReconciliationDecision::NoOpAlreadyCurrent {
            progress.enter(ReconcilerState::Done);
            return Ok(DeploymentReport {
                target_version: request.target_version.clone(),
                decision,
                outcome: DeployOutcome::AlreadyCurrent,
                initial_state: state,
                unload_reports: Vec::new(),
                workers: Vec::new(),
                warnings,
                transitions: progress.transitions,
                interrupted: false,
                started_at,
                finished_at: Utc::now(),
            });
        }

        let mut unload_reports = Vec::new();
        if decision == ReconciliationDecision::UpgradeViaUnloadThenInstall {
            progress.enter(ReconcilerState::Unloading);
            let targets: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.reachable)
                .map(|(name, _)| name.clone())
                .collect();
            // Returns only after every node has finished
            unload_reports = self.sequencer().run_all(&targets).await;
            for report in &unload_reports {
                warnings.extend(report.warnings.iter().cloned().map(DeployWarning::SequencerStep));
            }
        }

        progress.enter(ReconcilerState::Applying);
        if let Some(keys) = &request.signing {
            if let Err(e) = publish_signing_keys(self.api.as_ref(), &request.namespace, keys).await {
                return Err(progress.fail(DeployError::Apply(format!(
                    "publishing signing keys: {}",
                    e
                ))));
            }
        }
        if let Err(e) = self.api.apply(manifest).await {
            return Err(progress.fail(DeployError::Apply(e.to_string())));
        }
        info!("Manifest applied to {}", request.namespace);

        progress.enter(ReconcilerState::WaitingForReadiness);
        let ready_workers = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Interrupted while waiting for workers");
                None
            }
            ready = self.wait_for_ready_workers(request, &mut warnings) => Some(ready),
        };

        let (workers, interrupted) = match ready_workers {
            None => (Vec::new(), true),
            Some((all, streamable)) => {
                progress.enter(ReconcilerState::Streaming);
                let session = Arc::new(LogSession::new(cancel.clone()));
                let report = self
                    .supervisor(&request.namespace)
                    .stream(&streamable, session)
                    .await;
                for (worker, attempts, last_error) in report.exhausted() {
                    warnings.push(DeployWarning::StreamRetryExhausted {
                        worker: worker.to_string(),
                        attempts,
                        last_error: last_error.to_string(),
                    });
                }
                (all, report.cancelled)
            }
        };

        progress.enter(ReconcilerState::Done);

        let outcome = match decision {
            ReconciliationDecision::Install => DeployOutcome::FreshInstall,
            _ if unload_reports.iter().all(UnloadReport::is_clean) => {
                DeployOutcome::AppliedCleanUnload
            }
            _ => DeployOutcome::AppliedWithUnloadWarnings,
        };

        Ok(DeploymentReport {
            target_version: request.target_version.clone(),
            decision,
            outcome,
            initial_state: state,
            unload_reports,
            workers,
            warnings,
            transitions: progress.transitions,
            interrupted,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Local checks first, then the pull secret
    async fn check_preconditions(&self, request: &DeploymentRequest) -> Result<(), DeployError> {
        request.check_local_preconditions()?;

        let Some(name) = &request.pull_secret else {
            return Ok(());
        };
        let ns = &request.namespace;
        match check_pull_secret(self.api.as_ref(), ns, name).await {
            Ok(None) => Ok(()),
            Ok(Some(PullSecretProblem::Missing)) => Err(DeployError::Precondition(format!(
                "pull secret '{}' not found in namespace '{}'",
                name, ns
            ))),
            Ok(Some(PullSecretProblem::NoDockerConfig)) => Err(DeployError::Precondition(format!(
                "pull secret '{}' in namespace '{}' has no .dockerconfigjson entry",
                name, ns
            ))),
            Err(e) => Err(DeployError::Precondition(format!(
                "cannot verify pull secret '{}': {}",
                name, e
            ))),
        }
    }

    /// All workers found, and the ones worth streaming from
    async fn wait_for_ready_workers(
        &self,
        request: &DeploymentRequest,
        warnings: &mut Vec<DeployWarning>,
    ) -> (Vec<String>, Vec<String>) {
        let api = self.api.as_ref();
        let ns = request.namespace.as_str();
        let selector = self.options.worker_selector.as_str();
        let timings = &self.options.timings;

        let workers = match wait_for_workers(api, ns, selector, &timings.workers_waiter()).await {
            WaitOutcome::Ready(workers) => workers,
            _ => {
                warn!("No workers appeared in {}", ns);
                warnings.push(DeployWarning::ReadinessTimeout {
                    what: format!("workers in namespace {}", ns),
                    waited: timings.workers_appear,
                });
                return (Vec::new(), Vec::new());
            }
        };
        let names: Vec<String> = workers.into_iter().map(|w| w.name).collect();
        info!("{} workers scheduled: {}", names.len(), names.join(", "));

        let waiter = timings.worker_waiter(request.prebuilt);
        let outcomes = futures::future::join_all(
            names
                .iter()
                .map(|name| wait_for_worker_ready(api, ns, selector, name, &waiter)),
        )
        .await;

        let mut streamable = Vec::new();
        for (name, outcome) in names.iter().zip(outcomes) {
            match outcome {
                WaitOutcome::Ready(()) => streamable.push(name.clone()),
                WaitOutcome::ResourceGoneEarly => {
                    info!("Worker {} finished before it could be observed", name)
                }
                WaitOutcome::TimedOut => {
                    warn!("Worker {} not ready in time", name);
                    warnings.push(DeployWarning::ReadinessTimeout {
                        what: format!("worker {}", name),
                        waited: waiter.timeout(),
                    });
                }
            }
        }
        (names, streamable)
    }
}
