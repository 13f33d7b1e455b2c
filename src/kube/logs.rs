//! Log streaming from the workload.

use futures::{AsyncBufReadExt, StreamExt};
use kube::api::LogParams;

use super::{classify, KubeOrchestrator, LogStream};
use crate::error::OrchestratorError;

impl KubeOrchestrator {
    /// Opens a line stream over the `main` container log. With `follow`
    /// the stream stays open until the workload terminates or the
    /// consumer drops it.
    pub(super) async fn open_log_stream(
        &self,
        pod_name: &str,
        follow: bool,
        tail_lines: Option<i64>,
    ) -> Result<LogStream, OrchestratorError> {
        let lp = LogParams {
            container: Some("main".to_string()),
            follow,
            tail_lines,
            ..LogParams::default()
        };
        let reader = self
            .pods()
            .log_stream(pod_name, &lp)
            .await
            .map_err(classify)?;
        Ok(reader.lines().boxed())
    }
}
