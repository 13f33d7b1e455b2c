//! Exec into a running workload over the attach (websocket) channel.

use kube::api::AttachParams;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{classify, ExecOutput, KubeOrchestrator};
use crate::error::OrchestratorError;

impl KubeOrchestrator {
    /// Runs a command in the `main` container and captures its output and
    /// exit code. When `stdin` is given, the bytes are written to the
    /// process and the channel is closed afterwards.
    pub(super) async fn exec_in_pod(
        &self,
        pod_name: &str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, OrchestratorError> {
        let ap = AttachParams::default()
            .container("main")
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);

        debug!(pod = %pod_name, ?cmd, "exec");

        let mut attached = self
            .pods()
            .exec(pod_name, cmd.to_vec(), &ap)
            .await
            .map_err(classify)?;

        let mut stdout_reader = attached.stdout();
        let mut stderr_reader = attached.stderr();
        let mut stdin_writer = attached.stdin();

        let write_stdin = async {
            if let (Some(data), Some(writer)) = (stdin.as_deref(), stdin_writer.as_mut()) {
                writer.write_all(data).await?;
                writer.shutdown().await?;
            }
            // drop closes the channel so the remote process sees EOF
            drop(stdin_writer.take());
            Ok::<_, std::io::Error>(())
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let read_stdout = async {
            if let Some(reader) = stdout_reader.as_mut() {
                reader.read_to_end(&mut stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stderr = async {
            if let Some(reader) = stderr_reader.as_mut() {
                reader.read_to_end(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let (w, o, e) = tokio::join!(write_stdin, read_stdout, read_stderr);
        for res in [w, o, e] {
            res.map_err(|err| OrchestratorError::fatal(format!("exec stream: {err}")))?;
        }

        let status = match attached.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|err| OrchestratorError::fatal(format!("exec join: {err}")))?;

        let exit_code = status.map(|s| exit_code_from_status(&s)).unwrap_or(0);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// Extracts the command exit code from the attach status message.
fn exit_code_from_status(status: &k8s_openapi::apimachinery::pkg::apis::meta::v1::Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(1)
}
