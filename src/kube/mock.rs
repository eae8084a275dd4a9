//! Scripted in-memory cluster for tests
//!
//! Nodes keep a small model of kernel state (loaded modules, mounts, active
//! units) and interpret the scripts the probe and the unload sequencer send,
//! so tests observe real effects instead of canned replies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{ClusterApi, ClusterError, ExecOutput, LogStream, Node, SecretFile, WorkerPod};
use crate::module::state::PROBE_SCRIPT;
use crate::module::unload::{MANAGED_MODULES, PIPEFS_MOUNT_POINTS, SERVICE_UNITS, STEP_MARKER};

/// Something the fake cluster was asked to do, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Exec { node: String, script: String },
    Apply,
    /// Carries the rendered manifest
    Delete(String),
    PublishSecret(String),
}

/// Simulated kernel state of one node
#[derive(Debug, Clone, Default)]
pub struct FakeNode {
    pub not_ready: bool,
    pub unreachable: bool,
    pub release: Option<String>,
    pub scm: Option<String>,
    pub base: Option<String>,
    pub probe_output: Option<String>,
    pub modules: Vec<String>,
    pub stuck_modules: HashSet<String>,
    pub nfs_mounts: u32,
    pub active_units: Vec<String>,
    pub pipefs_mounted: Vec<String>,
}

impl FakeNode {
    /// Nothing from the bundle loaded; the rpcbind socket is always there
    pub fn empty() -> Self {
        Self {
            active_units: vec!["rpcbind.socket".to_string()],
            ..Default::default()
        }
    }

    /// Bundle fully loaded and in use
    pub fn loaded(version: &str) -> Self {
        let mut units: Vec<String> = SERVICE_UNITS.iter().map(|u| u.to_string()).collect();
        units.push("rpcbind.socket".to_string());
        Self {
            release: Some(version.to_string()),
            modules: MANAGED_MODULES.iter().map(|m| m.to_string()).collect(),
            nfs_mounts: 2,
            active_units: units,
            pipefs_mounted: PIPEFS_MOUNT_POINTS.iter().map(|p| p.to_string()).collect(),
            ..Self::empty()
        }
    }

    pub fn not_ready(mut self) -> Self {
        self.not_ready = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn with_probe_output(mut self, output: &str) -> Self {
        self.probe_output = Some(output.to_string());
        self
    }

    pub fn with_stuck_module(mut self, module: &str) -> Self {
        self.stuck_modules.insert(module.to_string());
        self
    }

    fn probe(&self) -> String {
        if let Some(out) = &self.probe_output {
            return out.clone();
        }
        let has_sunrpc = self.modules.iter().any(|m| m == "sunrpc");
        let release = if has_sunrpc { self.release.clone().unwrap_or_default() } else { String::new() };
        let scm = if has_sunrpc { self.scm.clone().unwrap_or_default() } else { String::new() };
        let base = if has_sunrpc { self.base.clone().unwrap_or_default() } else { String::new() };
        let loaded = if release.is_empty() && scm.is_empty() { 0 } else { 1 };
        format!("loaded={}\nrelease={}\nscm={}\nbase={}\n", loaded, release, scm, base)
    }

    fn run(&mut self, script: &str) -> ExecOutput {
        if script == PROBE_SCRIPT {
            return ExecOutput::ok(self.probe());
        }
        if script.contains(STEP_MARKER) {
            return self.run_batch(script);
        }
        if script.contains("umount -a -t") {
            self.nfs_mounts = 0;
            return ExecOutput::ok("");
        }
        if let Some(unit) = word_after(script, "systemctl stop ") {
            self.active_units.retain(|u| u != &unit);
            return ExecOutput::ok("");
        }
        if let Some(point) = word_after(script, "mountpoint -q ") {
            self.pipefs_mounted.retain(|p| p != &point);
            return ExecOutput::ok("");
        }
        if script.contains("drop_caches") {
            if self.modules.iter().any(|m| m == "sunrpc") {
                return ExecOutput::ok("flushed");
            }
            return ExecOutput::ok("");
        }
        if let Some(module) = word_after(script, "rmmod ") {
            if !self.modules.contains(&module) {
                return ExecOutput::ok("");
            }
            if self.stuck_modules.contains(&module) {
                return ExecOutput::failed(format!("rmmod: ERROR: Module {} is in use", module), 1);
            }
            self.modules.retain(|m| m != &module);
            return ExecOutput::ok("");
        }
        ExecOutput::failed(format!("sh: unexpected script: {}", script), 127)
    }
}

impl FakeNode {
    /// Run each `{ step; } 2>&1` line of a batch, echoing its status markers
    fn run_batch(&mut self, script: &str) -> ExecOutput {
        let mut output = String::new();
        for line in script.lines() {
            let Some(index) = line
                .split_once(STEP_MARKER)
                .and_then(|(_, rest)| rest.split_once(":begin"))
                .map(|(i, _)| i.to_string())
            else {
                continue;
            };
            let Some(step) = line
                .split_once("{ ")
                .and_then(|(_, rest)| rest.rsplit_once("; } 2>&1"))
                .map(|(step, _)| step)
            else {
                continue;
            };

            let out = self.run(step);
            output.push_str(&format!("{}{}:begin\n", STEP_MARKER, index));
            if !out.output.is_empty() {
                output.push_str(&out.output);
                output.push('\n');
            }
            output.push_str(&format!("{}{}:{}\n", STEP_MARKER, index, out.status));
        }
        ExecOutput::ok(output)
    }
}

fn word_after(script: &str, prefix: &str) -> Option<String> {
    let start = script.find(prefix)? + prefix.len();
    script[start..]
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .map(str::to_string)
}

/// One scripted response to `follow_logs`
#[derive(Debug, Clone)]
pub enum LogAttempt {
    /// The stream cannot be opened
    Refuse(String),
    /// Emits the lines and ends cleanly
    Lines(Vec<String>),
    /// Emits the lines then breaks
    LinesThenFail(Vec<String>, String),
    /// Emits the lines then never ends
    LinesThenHang(Vec<String>),
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl LogAttempt {
    pub fn lines(items: &[&str]) -> Self {
        Self::Lines(lines(items))
    }

    pub fn lines_then_fail(items: &[&str], reason: &str) -> Self {
        Self::LinesThenFail(lines(items), reason.to_string())
    }

    pub fn lines_then_hang(items: &[&str]) -> Self {
        Self::LinesThenHang(lines(items))
    }
}

/// In-memory [`ClusterApi`]
#[derive(Default)]
pub struct FakeCluster {
    nodes: Mutex<Vec<(String, FakeNode)>>,
    list_nodes_error: Mutex<Option<ClusterError>>,
    events: Mutex<Vec<Event>>,
    apply_error: Mutex<Option<String>>,
    worker_timeline: Mutex<VecDeque<Vec<WorkerPod>>>,
    list_worker_calls: AtomicUsize,
    fetchable_logs: Mutex<HashSet<String>>,
    log_scripts: Mutex<HashMap<String, VecDeque<LogAttempt>>>,
    follow_calls: Mutex<HashMap<String, usize>>,
    secrets: Mutex<HashMap<(String, String), HashMap<String, String>>>,
    exec_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, name: &str, node: FakeNode) -> Self {
        self.nodes.lock().unwrap().push((name.to_string(), node));
        self
    }

    pub fn with_list_nodes_error(self, error: ClusterError) -> Self {
        *self.list_nodes_error.lock().unwrap() = Some(error);
        self
    }

    pub fn with_apply_error(self, stderr: &str) -> Self {
        *self.apply_error.lock().unwrap() = Some(stderr.to_string());
        self
    }

    /// Successive `list_workers` results; the last one repeats
    pub fn with_worker_timeline(self, timeline: Vec<Vec<WorkerPod>>) -> Self {
        *self.worker_timeline.lock().unwrap() = timeline.into();
        self
    }

    pub fn with_fetchable_logs(self, worker: &str) -> Self {
        self.fetchable_logs.lock().unwrap().insert(worker.to_string());
        self
    }

    pub fn with_log_attempts(self, worker: &str, attempts: Vec<LogAttempt>) -> Self {
        self.log_scripts
            .lock()
            .unwrap()
            .insert(worker.to_string(), attempts.into());
        self
    }

    pub fn with_secret(self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
        self
    }

    pub fn with_exec_delay(self, delay: Duration) -> Self {
        *self.exec_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn apply_count(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::Apply).count()
    }

    pub fn deleted_manifests(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Delete(manifest) => Some(manifest),
                _ => None,
            })
            .collect()
    }

    /// Scripts executed on one node, in order
    pub fn scripts_for(&self, node: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Exec { node: n, script } if n == node => Some(script),
                _ => None,
            })
            .collect()
    }

    pub fn node_modules(&self, node: &str) -> Vec<String> {
        self.node_state(node).map(|n| n.modules).unwrap_or_default()
    }

    pub fn node_state(&self, node: &str) -> Option<FakeNode> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, state)| state.clone())
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<HashMap<String, String>> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn follow_calls(&self, worker: &str) -> usize {
        self.follow_calls
            .lock()
            .unwrap()
            .get(worker)
            .copied()
            .unwrap_or(0)
    }

    pub fn list_worker_calls(&self) -> usize {
        self.list_worker_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        if let Some(e) = self.list_nodes_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(name, n)| Node::new(name.clone(), !n.not_ready))
            .collect())
    }

    async fn exec_on_node(&self, node: &str, script: &str) -> Result<ExecOutput, ClusterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.exec_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.events.lock().unwrap().push(Event::Exec {
            node: node.to_string(),
            script: script.to_string(),
        });

        let result = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.iter_mut().find(|(n, _)| n == node) {
                Some((_, state)) if state.unreachable => Err(ClusterError::NodeUnreachable(
                    node.to_string(),
                    "pod did not start".to_string(),
                )),
                Some((_, state)) => Ok(state.run(script)),
                None => Err(ClusterError::NodeUnreachable(
                    node.to_string(),
                    "no such node".to_string(),
                )),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn apply(&self, _manifest: &str) -> Result<(), ClusterError> {
        if let Some(stderr) = self.apply_error.lock().unwrap().clone() {
            return Err(ClusterError::Command {
                command: "apply".to_string(),
                stderr,
            });
        }
        self.events.lock().unwrap().push(Event::Apply);
        Ok(())
    }

    async fn delete(&self, manifest: &str) -> Result<(), ClusterError> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Delete(manifest.to_string()));
        Ok(())
    }

    async fn list_workers(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<Vec<WorkerPod>, ClusterError> {
        self.list_worker_calls.fetch_add(1, Ordering::SeqCst);
        let mut timeline = self.worker_timeline.lock().unwrap();
        if timeline.len() > 1 {
            Ok(timeline.pop_front().unwrap_or_default())
        } else {
            Ok(timeline.front().cloned().unwrap_or_default())
        }
    }

    async fn fetch_logs(&self, _namespace: &str, worker: &str) -> Result<String, ClusterError> {
        if self.fetchable_logs.lock().unwrap().contains(worker) {
            Ok(format!("building module on {}\n", worker))
        } else {
            Err(ClusterError::Command {
                command: "logs".to_string(),
                stderr: format!("container in pod {} is waiting to start", worker),
            })
        }
    }

    async fn follow_logs(&self, _namespace: &str, worker: &str) -> Result<LogStream, ClusterError> {
        *self
            .follow_calls
            .lock()
            .unwrap()
            .entry(worker.to_string())
            .or_insert(0) += 1;

        let attempt = self
            .log_scripts
            .lock()
            .unwrap()
            .get_mut(worker)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| LogAttempt::Refuse("container is waiting to start".to_string()));

        let name = worker.to_string();
        match attempt {
            LogAttempt::Refuse(reason) => Err(ClusterError::Stream(name, reason)),
            LogAttempt::Lines(lines) => Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed()),
            LogAttempt::LinesThenFail(lines, reason) => Ok(futures::stream::iter(
                lines
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(ClusterError::Stream(name, reason)))),
            )
            .boxed()),
            LogAttempt::LinesThenHang(lines) => Ok(futures::stream::iter(lines.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
        }
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        Ok(self.secret(namespace, name).is_some())
    }

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, ClusterError> {
        Ok(self
            .secret(namespace, name)
            .and_then(|data| data.get(key).cloned()))
    }

    async fn publish_secret(
        &self,
        namespace: &str,
        name: &str,
        files: &[SecretFile],
    ) -> Result<(), ClusterError> {
        let data = files
            .iter()
            .map(|f| (f.key.clone(), f.path.display().to_string()))
            .collect();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
        self.events
            .lock()
            .unwrap()
            .push(Event::PublishSecret(name.to_string()));
        Ok(())
    }
}
