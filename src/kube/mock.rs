//! In-memory orchestrator double for backend tests.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::net::TcpStream;

use super::{ExecOutput, LogStream, Orchestrator, WorkloadStatus};
use crate::error::OrchestratorError;

/// Record of a resource a test created through the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResource {
    /// Resource kind (`pod`, `service`, `configmap`).
    pub kind: &'static str,
    /// Resource name.
    pub name: String,
    /// Labels attached at creation.
    pub labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct MockState {
    resources: Vec<MockResource>,
    statuses: VecDeque<WorkloadStatus>,
    execs: Vec<Vec<String>>,
    exec_stdins: Vec<Option<Vec<u8>>>,
    exec_results: VecDeque<ExecOutput>,
    log_lines: Vec<String>,
    forwards: Vec<(String, u16)>,
    create_pod_failures: VecDeque<OrchestratorError>,
    service_failures: VecDeque<OrchestratorError>,
    delete_service_failures: VecDeque<OrchestratorError>,
}

/// Scriptable [`Orchestrator`] keeping created resources in memory.
#[derive(Clone, Default)]
pub struct MockOrchestrator {
    state: Arc<Mutex<MockState>>,
}

impl MockOrchestrator {
    /// Creates an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues workload statuses returned by successive status polls; once
    /// drained, `Running` is reported.
    pub fn push_status(&self, status: WorkloadStatus) {
        self.state.lock().statuses.push_back(status);
    }

    /// Queues an error for the next pod submission.
    pub fn fail_next_pod_create(&self, err: OrchestratorError) {
        self.state.lock().create_pod_failures.push_back(err);
    }

    /// Queues an error for the next service creation.
    pub fn fail_next_service_create(&self, err: OrchestratorError) {
        self.state.lock().service_failures.push_back(err);
    }

    /// Queues an error for the next service deletion.
    pub fn fail_next_service_delete(&self, err: OrchestratorError) {
        self.state.lock().delete_service_failures.push_back(err);
    }

    /// Queues the result of the next exec call; once drained, execs
    /// succeed with empty output and exit code 0.
    pub fn push_exec_result(&self, out: ExecOutput) {
        self.state.lock().exec_results.push_back(out);
    }

    /// Sets the lines produced by log streams.
    pub fn set_log_lines(&self, lines: &[&str]) {
        self.state.lock().log_lines = lines.iter().map(ToString::to_string).collect();
    }

    /// Commands passed to exec so far.
    pub fn recorded_execs(&self) -> Vec<Vec<String>> {
        self.state.lock().execs.clone()
    }

    /// Stdin payloads passed to exec so far.
    pub fn recorded_exec_stdins(&self) -> Vec<Option<Vec<u8>>> {
        self.state.lock().exec_stdins.clone()
    }

    /// Pod/port pairs passed to forward_port so far.
    pub fn recorded_forwards(&self) -> Vec<(String, u16)> {
        self.state.lock().forwards.clone()
    }

    /// All currently live resources.
    pub fn resources(&self) -> Vec<MockResource> {
        self.state.lock().resources.clone()
    }

    fn record(&self, kind: &'static str, name: Option<&String>, labels: Option<&BTreeMap<String, String>>) {
        self.state.lock().resources.push(MockResource {
            kind,
            name: name.cloned().unwrap_or_default(),
            labels: labels.cloned().unwrap_or_default(),
        });
    }

    fn matches(resource: &MockResource, selector: &str) -> bool {
        selector.split(',').all(|clause| {
            match clause.split_once('=') {
                Some((k, v)) => resource.labels.get(k).map(String::as_str) == Some(v),
                None => false,
            }
        })
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn create_pod(&self, pod: &Pod) -> Result<(), OrchestratorError> {
        if let Some(err) = self.state.lock().create_pod_failures.pop_front() {
            return Err(err);
        }
        self.record("pod", pod.metadata.name.as_ref(), pod.metadata.labels.as_ref());
        Ok(())
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<(), OrchestratorError> {
        self.record("configmap", cm.metadata.name.as_ref(), cm.metadata.labels.as_ref());
        Ok(())
    }

    async fn create_service(&self, svc: &Service) -> Result<(), OrchestratorError> {
        if let Some(err) = self.state.lock().service_failures.pop_front() {
            return Err(err);
        }
        self.record("service", svc.metadata.name.as_ref(), svc.metadata.labels.as_ref());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock();
        if let Some(err) = state.delete_service_failures.pop_front() {
            return Err(err);
        }
        state
            .resources
            .retain(|r| !(r.kind == "service" && r.name == name));
        Ok(())
    }

    async fn workload_status(&self, _pod_name: &str) -> Result<WorkloadStatus, OrchestratorError> {
        Ok(self
            .state
            .lock()
            .statuses
            .pop_front()
            .unwrap_or(WorkloadStatus::Running))
    }

    async fn delete_labeled(&self, selector: &str) -> Result<(), OrchestratorError> {
        self.state
            .lock()
            .resources
            .retain(|r| !Self::matches(r, selector));
        Ok(())
    }

    async fn count_labeled(&self, selector: &str) -> Result<usize, OrchestratorError> {
        Ok(self
            .state
            .lock()
            .resources
            .iter()
            .filter(|r| Self::matches(r, selector))
            .count())
    }

    async fn labeled_values(
        &self,
        selector: &str,
        label: &str,
    ) -> Result<Vec<String>, OrchestratorError> {
        let mut values: Vec<String> = self
            .state
            .lock()
            .resources
            .iter()
            .filter(|r| Self::matches(r, selector))
            .filter_map(|r| r.labels.get(label).cloned())
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn exec(
        &self,
        _pod_name: &str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, OrchestratorError> {
        let mut state = self.state.lock();
        state.execs.push(cmd.to_vec());
        state.exec_stdins.push(stdin);
        Ok(state.exec_results.pop_front().unwrap_or_default())
    }

    async fn log_stream(
        &self,
        _pod_name: &str,
        _follow: bool,
        _tail_lines: Option<i64>,
    ) -> Result<LogStream, OrchestratorError> {
        let lines = self.state.lock().log_lines.clone();
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn forward_port(
        &self,
        pod_name: &str,
        pod_port: u16,
        _conn: TcpStream,
    ) -> Result<(), OrchestratorError> {
        self.state
            .lock()
            .forwards
            .push((pod_name.to_string(), pod_port));
        Ok(())
    }
}
