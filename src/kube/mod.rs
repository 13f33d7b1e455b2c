//! Orchestrator client.
//!
//! The [`Orchestrator`] trait is the seam between the backend and the
//! cluster: resource create/list/delete, workload status, exec, logs and
//! port-forwarding. [`KubeOrchestrator`] implements it against a real
//! cluster via `kube`; tests drive the backend with an in-memory mock.

mod client;
pub mod copy;
mod exec;
mod logs;
mod portforward;

#[cfg(test)]
pub(crate) mod mock;

pub use client::KubeOrchestrator;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use tokio::net::TcpStream;

use crate::error::OrchestratorError;

/// Observable state of a deployed workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStatus {
    /// Not yet running (scheduling, pulling, starting).
    Pending,
    /// Main process is alive.
    Running,
    /// Main process finished with exit code zero.
    Completed,
    /// The workload cannot come up (crash, image pull failure).
    Failed(String),
}

/// Captured output of a finished exec invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Exit code of the command.
    pub exit_code: i32,
}

/// A lazily produced sequence of log lines.
pub type LogStream = BoxStream<'static, std::io::Result<String>>;

/// Operations the backend needs from a cluster orchestrator.
///
/// Implementations must be safe to call concurrently; the backend never
/// holds an in-memory lock across any of these calls.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Creates a pod.
    async fn create_pod(&self, pod: &Pod) -> Result<(), OrchestratorError>;

    /// Creates a config object.
    async fn create_config_map(&self, cm: &ConfigMap) -> Result<(), OrchestratorError>;

    /// Creates a service object.
    async fn create_service(&self, svc: &Service) -> Result<(), OrchestratorError>;

    /// Deletes a service object by name; absent services are not an error.
    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError>;

    /// Reports the status of the workload backing the given pod.
    async fn workload_status(&self, pod_name: &str) -> Result<WorkloadStatus, OrchestratorError>;

    /// Deletes every pod, service and config object matching the label
    /// selector. Idempotent: deleting nothing is success.
    async fn delete_labeled(&self, selector: &str) -> Result<(), OrchestratorError>;

    /// Counts pods, services and config objects matching the selector.
    async fn count_labeled(&self, selector: &str) -> Result<usize, OrchestratorError>;

    /// Distinct values of `label` across every resource matching the
    /// selector.
    async fn labeled_values(
        &self,
        selector: &str,
        label: &str,
    ) -> Result<Vec<String>, OrchestratorError>;

    /// Runs a command in the workload, optionally feeding bytes to its
    /// stdin, and waits for it to finish.
    async fn exec(
        &self,
        pod_name: &str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, OrchestratorError>;

    /// Opens a log line stream for the workload.
    async fn log_stream(
        &self,
        pod_name: &str,
        follow: bool,
        tail_lines: Option<i64>,
    ) -> Result<LogStream, OrchestratorError>;

    /// Forwards one accepted local connection to a workload port. Returns
    /// when either side closes.
    async fn forward_port(
        &self,
        pod_name: &str,
        pod_port: u16,
        conn: TcpStream,
    ) -> Result<(), OrchestratorError>;
}

/// Classifies a `kube` client error into the retryable/fatal taxonomy.
pub(crate) fn classify(err: kube::Error) -> OrchestratorError {
    match &err {
        kube::Error::Api(resp) if resp.code == 429 || resp.code >= 500 => {
            OrchestratorError::transient(err.to_string())
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            OrchestratorError::transient(err.to_string())
        }
        _ => OrchestratorError::fatal(err.to_string()),
    }
}

/// True when the error is a 404 from the api-server.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}
