//! Local port endpoints.
//!
//! For every declared port of a started container the allocator binds an
//! ephemeral local listener and forwards each accepted connection to the
//! workload through the orchestrator. The mapping is published on the
//! instance only after the workload reported ready, so a client that reads
//! the mapping can connect immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kube::Orchestrator;
use crate::model::{Container, ContainerState};

struct Allocation {
    mapping: BTreeMap<u16, u16>,
    accept_tasks: Vec<JoinHandle<()>>,
}

/// Binds and tears down the local endpoints of container instances.
pub struct PortAllocator {
    orchestrator: Arc<dyn Orchestrator>,
    disable_port_forward: bool,
    allocations: DashMap<String, Allocation>,
}

impl PortAllocator {
    /// Creates an allocator forwarding through the given orchestrator.
    #[must_use]
    pub fn new(orchestrator: Arc<dyn Orchestrator>, disable_port_forward: bool) -> Self {
        Self {
            orchestrator,
            disable_port_forward,
            allocations: DashMap::new(),
        }
    }

    /// Binds one local listener per declared port and starts accepting.
    ///
    /// Returns the declared-to-local mapping. With forwarding disabled the
    /// mapping is empty and no listener is bound.
    pub async fn allocate(&self, tainr: &Container) -> Result<BTreeMap<u16, u16>> {
        if self.disable_port_forward || tainr.spec.exposed_ports.is_empty() {
            return Ok(BTreeMap::new());
        }

        let pod_name = tainr.pod_name();
        let mut mapping = BTreeMap::new();
        let mut accept_tasks = Vec::new();

        for &port in &tainr.spec.exposed_ports {
            let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|err| {
                Error::orchestrator(
                    &tainr.id,
                    "port-bind",
                    crate::error::OrchestratorError::fatal(err.to_string()),
                )
            })?;
            let local = listener
                .local_addr()
                .map_err(|err| {
                    Error::orchestrator(
                        &tainr.id,
                        "port-bind",
                        crate::error::OrchestratorError::fatal(err.to_string()),
                    )
                })?
                .port();
            mapping.insert(port, local);
            debug!(id = %tainr.short_id, port, local, "endpoint bound");

            let orchestrator = Arc::clone(&self.orchestrator);
            let pod = pod_name.clone();
            accept_tasks.push(tokio::spawn(async move {
                loop {
                    let conn = match listener.accept().await {
                        Ok((conn, _)) => conn,
                        Err(err) => {
                            warn!(pod = %pod, port, error = %err, "accept failed, endpoint closed");
                            return;
                        }
                    };
                    let orchestrator = Arc::clone(&orchestrator);
                    let pod = pod.clone();
                    tokio::spawn(async move {
                        if let Err(err) = orchestrator.forward_port(&pod, port, conn).await {
                            warn!(pod = %pod, port, error = %err, "port forward ended with error");
                        }
                    });
                }
            }));
        }

        self.allocations.insert(
            tainr.id.clone(),
            Allocation {
                mapping: mapping.clone(),
                accept_tasks,
            },
        );
        Ok(mapping)
    }

    /// Local endpoint for a declared port. Allocations exist from the
    /// moment the workload is submitted, but none is handed out before
    /// the container reports `Running`.
    pub fn lookup(&self, tainr: &Container, port: u16) -> Result<u16> {
        if tainr.state() != ContainerState::Running {
            return Err(Error::NotReady {
                id: tainr.id.clone(),
                port,
            });
        }
        self.allocations
            .get(&tainr.id)
            .and_then(|alloc| alloc.mapping.get(&port).copied())
            .ok_or(Error::NotReady {
                id: tainr.id.clone(),
                port,
            })
    }

    /// Closes the endpoints of one container. Idempotent.
    pub fn release(&self, container_id: &str) {
        if let Some((_, alloc)) = self.allocations.remove(container_id) {
            for task in alloc.accept_tasks {
                task.abort();
            }
            debug!(id = %crate::model::short_id(container_id), "endpoints released");
        }
    }
}

impl Drop for PortAllocator {
    fn drop(&mut self) {
        for mut entry in self.allocations.iter_mut() {
            for task in entry.value_mut().accept_tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::mock::MockOrchestrator;
    use crate::model::{ContainerSpec, ContainerState};
    use std::time::Duration;

    fn container(ports: Vec<u16>) -> Container {
        Container::new(
            "web",
            ContainerSpec {
                image: "img".into(),
                exposed_ports: ports,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_allocate_binds_distinct_local_ports() {
        let orch = Arc::new(MockOrchestrator::new());
        let allocator = PortAllocator::new(orch, false);
        let tainr = container(vec![80, 443]);

        let mapping = allocator.allocate(&tainr).await.unwrap();

        assert_eq!(mapping.len(), 2);
        assert_ne!(mapping[&80], mapping[&443]);
        assert!(mapping.values().all(|&p| p != 0));
        allocator.release(&tainr.id);
    }

    #[tokio::test]
    async fn test_accepted_connection_is_forwarded() {
        let orch = Arc::new(MockOrchestrator::new());
        let allocator = PortAllocator::new(Arc::clone(&orch) as Arc<dyn Orchestrator>, false);
        let tainr = container(vec![5432]);

        let mapping = allocator.allocate(&tainr).await.unwrap();
        let local = mapping[&5432];

        let _conn = tokio::net::TcpStream::connect(("127.0.0.1", local))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let forwards = orch.recorded_forwards();
        assert_eq!(forwards, vec![(tainr.pod_name(), 5432)]);
        allocator.release(&tainr.id);
    }

    #[tokio::test]
    async fn test_disabled_forwarding_yields_empty_mapping() {
        let orch = Arc::new(MockOrchestrator::new());
        let allocator = PortAllocator::new(orch, true);
        let mapping = allocator.allocate(&container(vec![80])).await.unwrap();
        assert!(mapping.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_rejects_scheduled_instance() {
        let orch = Arc::new(MockOrchestrator::new());
        let allocator = PortAllocator::new(orch, false);
        let tainr = container(vec![80]);

        // Allocation happens before the readiness wait; the endpoint must
        // stay unavailable until the workload actually runs.
        let mapping = allocator.allocate(&tainr).await.unwrap();
        tainr.set_state(ContainerState::Pending);
        tainr.set_state(ContainerState::Scheduled);
        assert!(matches!(
            allocator.lookup(&tainr, 80),
            Err(Error::NotReady { .. })
        ));

        tainr.set_state(ContainerState::Running);
        assert_eq!(allocator.lookup(&tainr, 80).unwrap(), mapping[&80]);
        allocator.release(&tainr.id);
    }

    #[tokio::test]
    async fn test_lookup_requires_running_state() {
        let orch = Arc::new(MockOrchestrator::new());
        let allocator = PortAllocator::new(orch, false);
        let tainr = container(vec![80]);

        let mapping = allocator.allocate(&tainr).await.unwrap();
        assert!(matches!(
            allocator.lookup(&tainr, 80),
            Err(Error::NotReady { .. })
        ));

        tainr.set_state(ContainerState::Running);
        assert_eq!(allocator.lookup(&tainr, 80).unwrap(), mapping[&80]);
        assert!(allocator.lookup(&tainr, 9999).is_err());

        allocator.release(&tainr.id);
        allocator.release(&tainr.id);
    }
}
