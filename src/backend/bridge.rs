//! Exec sessions and log streaming.
//!
//! A thin bridge between the container model and the orchestrator's io
//! channels. Exec sessions are two-step: created first, run later, with
//! the exit code retained on the session for subsequent inspection. Log
//! streams in follow mode are cut off as soon as the instance reaches a
//! terminal state rather than leaving the client hanging.

use std::sync::Arc;

use futures::StreamExt;

use crate::error::{Error, Result};
use crate::kube::{ExecOutput, LogStream, Orchestrator};
use crate::model::{Container, ExecSession, Registry};

/// Runs exec sessions and opens log streams.
pub struct IoBridge {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<Registry>,
}

impl IoBridge {
    /// Creates a bridge over the given orchestrator.
    #[must_use]
    pub fn new(orchestrator: Arc<dyn Orchestrator>, registry: Arc<Registry>) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }

    /// Registers an exec session against a running container.
    pub fn create_exec(
        &self,
        tainr: &Container,
        cmd: Vec<String>,
        stdout: bool,
        stderr: bool,
    ) -> Result<Arc<ExecSession>> {
        if tainr.state() != crate::model::ContainerState::Running {
            return Err(Error::NotRunning {
                id: tainr.id.clone(),
            });
        }
        let exec = Arc::new(ExecSession::new(&tainr.id, cmd, stdout, stderr));
        self.registry.save_exec(Arc::clone(&exec));
        Ok(exec)
    }

    /// Runs a previously created exec session to completion and records
    /// its exit code.
    pub async fn run_exec(&self, exec_id: &str) -> Result<ExecOutput> {
        let exec = self.registry.exec(exec_id)?;
        let tainr = self.registry.container(&exec.container_id)?;
        if tainr.state() != crate::model::ContainerState::Running {
            return Err(Error::NotRunning {
                id: tainr.id.clone(),
            });
        }

        let output = self
            .orchestrator
            .exec(&tainr.pod_name(), &exec.cmd, None)
            .await
            .map_err(|err| Error::orchestrator(&tainr.id, "exec", err))?;
        exec.set_exit_code(output.exit_code);
        Ok(output)
    }

    /// Opens the container's log stream. In follow mode the stream ends
    /// when the instance reaches a terminal state.
    pub async fn stream_logs(
        &self,
        tainr: &Arc<Container>,
        follow: bool,
        tail_lines: Option<i64>,
    ) -> Result<LogStream> {
        let stream = self
            .orchestrator
            .log_stream(&tainr.pod_name(), follow, tail_lines)
            .await
            .map_err(|err| Error::orchestrator(&tainr.id, "logs", err))?;

        if !follow {
            return Ok(stream);
        }

        let mut rx = tainr.watch_state();
        let terminal = async move {
            loop {
                if rx.borrow().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        Ok(stream.take_until(Box::pin(terminal)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::mock::MockOrchestrator;
    use crate::model::{ContainerSpec, ContainerState};
    use std::time::Duration;

    fn fixture() -> (Arc<MockOrchestrator>, Arc<Registry>, IoBridge) {
        let orch = Arc::new(MockOrchestrator::new());
        let registry = Arc::new(Registry::new());
        let bridge = IoBridge::new(
            Arc::clone(&orch) as Arc<dyn Orchestrator>,
            Arc::clone(&registry),
        );
        (orch, registry, bridge)
    }

    fn running_container(registry: &Registry) -> Arc<Container> {
        let tainr = Arc::new(Container::new(
            "web",
            ContainerSpec {
                image: "img".into(),
                ..Default::default()
            },
        ));
        tainr.set_state(ContainerState::Running);
        registry.save_container(Arc::clone(&tainr));
        tainr
    }

    #[tokio::test]
    async fn test_exec_runs_and_records_exit_code() {
        let (orch, registry, bridge) = fixture();
        let tainr = running_container(&registry);
        orch.push_exec_result(ExecOutput {
            stdout: b"ok\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        });

        let cmd = vec!["echo".to_string(), "ok".to_string()];
        let exec = bridge.create_exec(&tainr, cmd.clone(), true, true).unwrap();
        assert!(exec.exit_code().is_none());

        let output = bridge.run_exec(&exec.id).await.unwrap();

        assert_eq!(output.stdout, b"ok\n");
        assert_eq!(exec.exit_code(), Some(0));
        assert_eq!(orch.recorded_execs(), vec![cmd]);
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let (_orch, registry, bridge) = fixture();
        let tainr = Arc::new(Container::new(
            "web",
            ContainerSpec {
                image: "img".into(),
                ..Default::default()
            },
        ));
        registry.save_container(Arc::clone(&tainr));

        let err = bridge
            .create_exec(&tainr, vec!["true".into()], true, true)
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_log_stream_yields_lines() {
        let (orch, registry, bridge) = fixture();
        let tainr = running_container(&registry);
        orch.set_log_lines(&["line one", "line two"]);

        let stream = bridge.stream_logs(&tainr, false, None).await.unwrap();
        let lines: Vec<String> = stream.map(|l| l.unwrap()).collect().await;

        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[tokio::test]
    async fn test_follow_stream_ends_on_terminal_state() {
        let (orch, registry, bridge) = fixture();
        let tainr = running_container(&registry);
        orch.set_log_lines(&["only line"]);

        let stream = bridge.stream_logs(&tainr, true, None).await.unwrap();
        tainr.set_state(ContainerState::Stopped);

        let lines = tokio::time::timeout(Duration::from_secs(1), async {
            stream.map(|l| l.unwrap()).collect::<Vec<_>>().await
        })
        .await
        .unwrap();
        assert!(lines.len() <= 1);
    }
}
