//! ReadinessWaiter - bounded polling with a tri-state result
//!
//! Every wait is sleep-then-recheck on the tokio timer, so tests drive it
//! with paused time.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::kube::{ClusterApi, WorkerPhase, WorkerPod};

/// What one check saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T = ()> {
    /// The predicate holds
    Ready(T),
    /// The resource exists but is not ready yet
    NotReady,
    /// The resource does not exist
    Absent,
}

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T = ()> {
    Ready(T),
    /// No evidence of success or failure within the budget
    TimedOut,
    /// Observed once, then vanished before becoming ready
    ResourceGoneEarly,
}

impl<T> WaitOutcome<T> {
    /// Anything but a timeout counts as success
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::TimedOut)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::TimedOut => "timed out",
            Self::ResourceGoneEarly => "gone before observed ready",
        }
    }
}

/// Polls a check until it is ready, the resource vanishes, or time runs out
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter {
    timeout: Duration,
    poll_interval: Duration,
    assume_seen: bool,
}

impl ReadinessWaiter {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            assume_seen: false,
        }
    }

    /// The resource is known to have existed before the first check
    pub fn already_observed(mut self) -> Self {
        self.assume_seen = true;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `check` now, then after every poll interval until a verdict
    ///
    /// `Absent` only ends the wait once the resource has been seen; before
    /// that it is just not there yet.
    pub async fn wait_for<T, F, Fut>(&self, mut check: F) -> WaitOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Observation<T>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut seen = self.assume_seen;

        loop {
            match check().await {
                Observation::Ready(value) => return WaitOutcome::Ready(value),
                Observation::NotReady => seen = true,
                Observation::Absent if seen => return WaitOutcome::ResourceGoneEarly,
                Observation::Absent => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Poll timings for the two waits of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessTimings {
    pub poll_interval: Duration,
    /// Budget for the first worker to show up after apply
    pub workers_appear: Duration,
    /// Budget for one worker to become streamable
    pub worker_ready: Duration,
    /// Tighter budget when the image ships pre-built modules
    pub prebuilt_ready: Duration,
}

impl Default for ReadinessTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            workers_appear: Duration::from_secs(60),
            worker_ready: Duration::from_secs(300),
            prebuilt_ready: Duration::from_secs(30),
        }
    }
}

impl ReadinessTimings {
    pub fn workers_waiter(&self) -> ReadinessWaiter {
        ReadinessWaiter::new(self.workers_appear, self.poll_interval)
    }

    /// Waiter for a worker that has already been listed once
    pub fn worker_waiter(&self, prebuilt: bool) -> ReadinessWaiter {
        let timeout = if prebuilt {
            self.prebuilt_ready
        } else {
            self.worker_ready
        };
        ReadinessWaiter::new(timeout, self.poll_interval).already_observed()
    }
}

/// Wait until at least one worker matching `selector` exists
pub async fn wait_for_workers(
    api: &dyn ClusterApi,
    namespace: &str,
    selector: &str,
    waiter: &ReadinessWaiter,
) -> WaitOutcome<Vec<WorkerPod>> {
    waiter
        .wait_for(move || async move {
            match api.list_workers(namespace, selector).await {
                Ok(workers) if !workers.is_empty() => Observation::Ready(workers),
                Ok(_) => Observation::Absent,
                Err(e) => {
                    warn!("Listing workers in {} failed: {}", namespace, e);
                    Observation::Absent
                }
            }
        })
        .await
}

/// A listed worker is streamable
///
/// A terminal phase counts as ready: a failed worker's logs are what the
/// operator needs to see.
pub fn worker_is_ready(worker: &WorkerPod) -> bool {
    worker.ready_containers > 0
        || worker.phase == WorkerPhase::Running
        || worker.phase.is_terminal()
}

/// Wait until one worker can be streamed from
pub async fn wait_for_worker_ready(
    api: &dyn ClusterApi,
    namespace: &str,
    selector: &str,
    worker: &str,
    waiter: &ReadinessWaiter,
) -> WaitOutcome {
    let outcome = waiter
        .wait_for(move || async move {
            let workers = match api.list_workers(namespace, selector).await {
                Ok(workers) => workers,
                Err(e) => {
                    warn!("Listing workers in {} failed: {}", namespace, e);
                    return Observation::NotReady;
                }
            };

            let Some(pod) = workers.iter().find(|w| w.name == worker) else {
                return Observation::Absent;
            };
            if worker_is_ready(pod) {
                return Observation::Ready(());
            }

            // Best effort: a worker that already logs is good enough
            match api.fetch_logs(namespace, worker).await {
                Ok(_) => Observation::Ready(()),
                Err(_) => Observation::NotReady,
            }
        })
        .await;

    debug!("Worker {} readiness: {}", worker, outcome.label());
    outcome
}
