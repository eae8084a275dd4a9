//! Deployment of the module loader workload
//!
//! - [`request`]: what to deploy, validated at the boundary
//! - [`secrets`]: pull-secret precondition and signing-key publication
//! - [`readiness`]: bounded polling for workers
//! - [`logs`]: supervised log streaming from workers
//! - [`reconciler`]: the state machine tying it all together

pub mod logs;
pub mod readiness;
pub mod reconciler;
pub mod request;
pub mod secrets;

pub use logs::{
    CollectingSink, LogSession, LogSink, LogStreamSupervisor, RetryPolicy, SessionReport,
    StdoutSink, StreamOutcome,
};
pub use readiness::{
    wait_for_worker_ready, wait_for_workers, Observation, ReadinessTimings, ReadinessWaiter,
    WaitOutcome,
};
pub use reconciler::{
    decide, DeployError, DeployOutcome, DeployWarning, DeploymentReconciler, DeploymentReport,
    ReconcilerOptions, ReconcilerState, ReconciliationDecision,
};
pub use request::{DeploymentRequest, RequestError, SigningKeys};
pub use secrets::{check_pull_secret, publish_signing_keys, PullSecretProblem};
