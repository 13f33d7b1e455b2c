//! Port-forwarding a local connection into a workload port.

use tokio::net::TcpStream;
use tracing::debug;

use super::{classify, KubeOrchestrator};
use crate::error::OrchestratorError;

impl KubeOrchestrator {
    /// Pipes one accepted local connection to the given workload port
    /// and back until either side closes.
    pub(super) async fn forward_connection(
        &self,
        pod_name: &str,
        pod_port: u16,
        mut conn: TcpStream,
    ) -> Result<(), OrchestratorError> {
        let mut forwarder = self
            .pods()
            .portforward(pod_name, &[pod_port])
            .await
            .map_err(classify)?;
        let mut upstream = forwarder.take_stream(pod_port).ok_or_else(|| {
            OrchestratorError::fatal(format!("no forward stream for port {pod_port}"))
        })?;

        debug!(pod = %pod_name, port = pod_port, "forwarding connection");

        tokio::io::copy_bidirectional(&mut conn, &mut upstream)
            .await
            .map_err(|err| OrchestratorError::transient(format!("port-forward: {err}")))?;
        drop(upstream);

        let _ = forwarder.join().await;
        Ok(())
    }
}
