//! LogStreamSupervisor - follows worker logs as one cancellable session
//!
//! Each worker gets its own task in a [`JoinSet`] with an independent retry
//! budget. Progress lives in a [`LogSession`] so a re-attached stream skips
//! the lines it already delivered. Cancelling the session token aborts every
//! task before [`LogStreamSupervisor::stream`] returns.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kube::ClusterApi;

/// Per-worker retry bound and pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_secs(3),
        }
    }
}

/// Where streamed lines go
pub trait LogSink: Send + Sync {
    fn line(&self, worker: &str, line: &str);
}

/// Prints `[worker] line` to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn line(&self, worker: &str, line: &str) {
        println!("[{}] {}", worker, line);
    }
}

/// Keeps every line in memory, in arrival order
#[derive(Debug, Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<(String, String)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Lines of one worker
    pub fn lines_for(&self, worker: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(w, _)| w == worker)
            .map(|(_, line)| line)
            .collect()
    }
}

impl LogSink for CollectingSink {
    fn line(&self, worker: &str, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((worker.to_string(), line.to_string()));
        }
    }
}

/// How one worker's stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The worker stopped writing and the stream closed
    Completed,
    /// Every attempt failed
    RetryExhausted { attempts: u32, last_error: String },
    /// The session was cancelled first
    Cancelled,
}

#[derive(Debug, Clone, Default)]
struct WorkerProgress {
    attempts: u32,
    delivered: usize,
}

/// Workers being streamed, with their retry counters and delivered lines
#[derive(Debug)]
pub struct LogSession {
    workers: DashMap<String, WorkerProgress>,
    cancel: CancellationToken,
}

impl LogSession {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            workers: DashMap::new(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn watch(&self, worker: &str) {
        self.workers.entry(worker.to_string()).or_default();
    }

    pub fn workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn attempts(&self, worker: &str) -> u32 {
        self.workers.get(worker).map(|p| p.attempts).unwrap_or(0)
    }

    pub fn delivered(&self, worker: &str) -> usize {
        self.workers.get(worker).map(|p| p.delivered).unwrap_or(0)
    }

    fn begin_attempt(&self, worker: &str) -> u32 {
        let mut progress = self.workers.entry(worker.to_string()).or_default();
        progress.attempts += 1;
        progress.attempts
    }

    fn mark_delivered(&self, worker: &str, count: usize) {
        if let Some(mut progress) = self.workers.get_mut(worker) {
            progress.delivered = progress.delivered.max(count);
        }
    }
}

/// Result of a streaming session
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub outcomes: BTreeMap<String, StreamOutcome>,
    pub cancelled: bool,
}

impl SessionReport {
    /// Workers that never got a usable stream
    pub fn exhausted(&self) -> Vec<(&str, u32, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(worker, outcome)| match outcome {
                StreamOutcome::RetryExhausted {
                    attempts,
                    last_error,
                } => Some((worker.as_str(), *attempts, last_error.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| **o == StreamOutcome::Completed)
            .count()
    }
}

/// Follows many workers concurrently until they finish or the session is cancelled
#[derive(Clone)]
pub struct LogStreamSupervisor {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    policy: RetryPolicy,
    sink: Arc<dyn LogSink>,
}

impl LogStreamSupervisor {
    pub fn new(api: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            policy: RetryPolicy::default(),
            sink: Arc::new(StdoutSink),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stream every worker; blocks until all are done or the session is cancelled
    pub async fn stream(&self, workers: &[String], session: Arc<LogSession>) -> SessionReport {
        let cancel = session.cancel_token();
        let mut report = SessionReport::default();
        let mut set = JoinSet::new();

        for worker in workers {
            session.watch(worker);
            let task = FollowTask {
                api: Arc::clone(&self.api),
                namespace: self.namespace.clone(),
                worker: worker.clone(),
                policy: self.policy,
                sink: Arc::clone(&self.sink),
                session: Arc::clone(&session),
                cancel: cancel.clone(),
            };
            set.spawn(async move {
                let outcome = task.run().await;
                (task.worker, outcome)
            });
        }

        info!("Streaming logs from {} workers", workers.len());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Log session cancelled, stopping {} streams", set.len());
                    set.abort_all();
                    while let Some(joined) = set.join_next().await {
                        if let Ok((worker, outcome)) = joined {
                            report.outcomes.insert(worker, outcome);
                        }
                    }
                    report.cancelled = true;
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(Ok((worker, outcome))) => {
                        debug!("Stream for {} ended: {:?}", worker, outcome);
                        report.outcomes.insert(worker, outcome);
                    }
                    Some(Err(e)) => warn!("Log stream task failed: {}", e),
                    None => break,
                },
            }
        }

        for worker in workers {
            report
                .outcomes
                .entry(worker.clone())
                .or_insert(StreamOutcome::Cancelled);
        }
        report
    }
}

struct FollowTask {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    worker: String,
    policy: RetryPolicy,
    sink: Arc<dyn LogSink>,
    session: Arc<LogSession>,
    cancel: CancellationToken,
}

impl FollowTask {
    async fn run(&self) -> StreamOutcome {
        let mut last_error = String::new();

        loop {
            let attempt = self.session.begin_attempt(&self.worker);

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return StreamOutcome::Cancelled,
                opened = self.api.follow_logs(&self.namespace, &self.worker) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    let skip = self.session.delivered(&self.worker);
                    let mut index = 0usize;
                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => return StreamOutcome::Cancelled,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(line)) => {
                                index += 1;
                                if index > skip {
                                    self.sink.line(&self.worker, &line);
                                    self.session.mark_delivered(&self.worker, index);
                                }
                            }
                            Some(Err(e)) => {
                                last_error = e.to_string();
                                break;
                            }
                            None => return StreamOutcome::Completed,
                        }
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    "Giving up on logs of {} after {} attempts: {}",
                    self.worker, attempt, last_error
                );
                return StreamOutcome::RetryExhausted {
                    attempts: attempt,
                    last_error,
                };
            }

            warn!(
                "Log stream for {} unavailable (attempt {}/{}): {}",
                self.worker, attempt, self.policy.max_attempts, last_error
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return StreamOutcome::Cancelled,
                _ = tokio::time::sleep(self.policy.backoff) => {}
            }
        }
    }
}
