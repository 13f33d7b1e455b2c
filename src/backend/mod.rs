//! Container backend.
//!
//! The [`Backend`] is the single entry point the API surface talks to. It
//! owns the registry, the lifecycle controller and the io bridge, and
//! exposes the operations of the engine in domain terms; the HTTP layer
//! only translates wire requests into these calls.

pub mod bridge;
pub mod lifecycle;
pub mod mapper;
pub mod mounts;
pub mod network;
pub mod ports;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kube::{ExecOutput, LogStream, Orchestrator};
use crate::model::{Container, ContainerSpec, ContainerState, ExecSession, Network, Registry};

use bridge::IoBridge;
use lifecycle::LifecycleController;
use mapper::{container_selector, managed_selector, ResourceMapper, LABEL_CONTAINER_ID};
use mounts::MountMaterializer;
use network::AliasResolver;
use ports::PortAllocator;

const REAP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// The engine backend: registry, lifecycle and io in one handle.
pub struct Backend {
    registry: Arc<Registry>,
    orchestrator: Arc<dyn Orchestrator>,
    controller: LifecycleController,
    ports: Arc<PortAllocator>,
    resolver: Arc<AliasResolver>,
    bridge: IoBridge,
}

impl Backend {
    /// Wires up a backend. `shutdown` flipping to true cancels in-flight
    /// start waits; the caller keeps the sender.
    #[must_use]
    pub fn new(
        config: &Config,
        orchestrator: Arc<dyn Orchestrator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let mapper = ResourceMapper::new(&config.namespace)
            .with_service_account(config.service_account.clone())
            .with_pull_policy(config.pull_policy.clone());
        let ports = Arc::new(PortAllocator::new(
            Arc::clone(&orchestrator),
            config.disable_port_forward,
        ));
        let resolver = Arc::new(AliasResolver::new(
            Arc::clone(&orchestrator),
            mapper.clone(),
            config.disable_services,
        ));
        let controller = LifecycleController::new(
            Arc::clone(&orchestrator),
            Arc::clone(&registry),
            mapper,
            MountMaterializer::new(config.disable_exec_copy),
            Arc::clone(&ports),
            Arc::clone(&resolver),
            config.start_timeout(),
            config.ready_requires_mounts,
            shutdown,
        );
        let bridge = IoBridge::new(Arc::clone(&orchestrator), Arc::clone(&registry));
        Self {
            registry,
            orchestrator,
            controller,
            ports,
            resolver,
            bridge,
        }
    }

    /// The shared registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ---- containers ----

    /// Registers a new container in the `Created` state, a member of the
    /// `bridge` network unless the spec names other networks.
    pub fn create_container(
        &self,
        name: impl Into<String>,
        spec: ContainerSpec,
        networks: &[String],
    ) -> Result<Arc<Container>> {
        let tainr = Arc::new(Container::new(name, spec));

        let keys: Vec<String> = if networks.is_empty() {
            vec!["bridge".to_string()]
        } else {
            networks.to_vec()
        };
        for key in &keys {
            let netw = self.registry.network(key)?;
            netw.add_member(&tainr.id);
            tainr.connect_network(&netw.id);
        }

        self.registry.save_container(Arc::clone(&tainr));
        info!(id = %tainr.short_id, name = %tainr.name(), image = %tainr.spec.image, "container created");
        Ok(tainr)
    }

    /// Resolves a container by id, short id prefix or name.
    pub fn container(&self, key: &str) -> Result<Arc<Container>> {
        self.registry.container(key)
    }

    /// All known containers.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.registry.containers()
    }

    /// Starts a container.
    pub async fn start_container(&self, key: &str) -> Result<Arc<Container>> {
        let tainr = self.registry.container(key)?;
        self.controller.start(&tainr).await?;
        Ok(tainr)
    }

    /// Stops a container, tearing down its cluster resources.
    pub async fn stop_container(&self, key: &str) -> Result<Arc<Container>> {
        let tainr = self.registry.container(key)?;
        self.controller.stop(&tainr).await?;
        Ok(tainr)
    }

    /// Restarts a container: stop followed by start.
    pub async fn restart_container(&self, key: &str) -> Result<Arc<Container>> {
        let tainr = self.registry.container(key)?;
        self.controller.stop(&tainr).await?;
        self.controller.start(&tainr).await?;
        Ok(tainr)
    }

    /// Stops the container if needed and forgets it.
    pub async fn remove_container(&self, key: &str) -> Result<()> {
        let tainr = self.registry.container(key)?;
        self.controller.remove(&tainr).await
    }

    /// Renames a container. The registry resolves names by scan, so only
    /// the instance record changes.
    pub fn rename_container(&self, key: &str, new_name: &str) -> Result<()> {
        let tainr = self.registry.container(key)?;
        if self.registry.container(new_name).is_ok() {
            return Err(Error::InvalidSpec {
                reason: format!("name `{new_name}` is already in use"),
            });
        }
        tainr.set_name(new_name);
        Ok(())
    }

    /// Waits until the container reaches a terminal state and returns its
    /// exit-ish status code (0 on clean stop, 1 on failure).
    pub async fn wait_container(&self, key: &str) -> Result<i32> {
        let tainr = self.registry.container(key)?;
        let mut rx = tainr.watch_state();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return Ok(if state == ContainerState::Failed { 1 } else { 0 });
            }
            if rx.changed().await.is_err() {
                return Ok(0);
            }
        }
    }

    /// Local endpoint for a declared port of a running container.
    pub fn endpoint(&self, key: &str, port: u16) -> Result<u16> {
        let tainr = self.registry.container(key)?;
        self.ports.lookup(&tainr, port)
    }

    // ---- networks ----

    /// Creates a network. Names are unique including the predefined ones.
    pub fn create_network(&self, name: &str) -> Result<Arc<Network>> {
        if self.registry.network(name).is_ok() {
            return Err(Error::InvalidSpec {
                reason: format!("network `{name}` already exists"),
            });
        }
        let netw = Arc::new(Network::new(name));
        self.registry.save_network(Arc::clone(&netw));
        info!(id = %netw.short_id, name = %netw.name, "network created");
        Ok(netw)
    }

    /// Resolves a network by id, short id prefix or name.
    pub fn network(&self, key: &str) -> Result<Arc<Network>> {
        self.registry.network(key)
    }

    /// All known networks.
    #[must_use]
    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.registry.networks()
    }

    /// Deletes a network. Predefined networks and networks with members
    /// cannot be deleted.
    pub fn delete_network(&self, key: &str) -> Result<()> {
        let netw = self.registry.network(key)?;
        if netw.is_predefined() {
            return Err(Error::InvalidSpec {
                reason: format!("network `{}` is predefined", netw.name),
            });
        }
        if !netw.members().is_empty() {
            return Err(Error::InvalidSpec {
                reason: format!("network `{}` still has containers attached", netw.name),
            });
        }
        self.registry.delete_network(&netw.id);
        Ok(())
    }

    /// Connects a container to a network. For a running container the
    /// aliases become resolvable immediately.
    pub async fn connect_network(&self, netw_key: &str, container_key: &str) -> Result<()> {
        let netw = self.registry.network(netw_key)?;
        let tainr = self.registry.container(container_key)?;
        if tainr.state() == ContainerState::Running {
            self.resolver.join(&netw, &tainr).await
        } else {
            netw.add_member(&tainr.id);
            tainr.connect_network(&netw.id);
            Ok(())
        }
    }

    /// Disconnects a container from a network, dropping its aliases there.
    pub async fn disconnect_network(&self, netw_key: &str, container_key: &str) -> Result<()> {
        let netw = self.registry.network(netw_key)?;
        let tainr = self.registry.container(container_key)?;
        if !netw.members().contains(&tainr.id) {
            return Err(Error::NotFound {
                kind: "network",
                id: netw_key.to_string(),
            });
        }
        self.resolver.leave(&netw, &tainr).await?;
        Ok(())
    }

    /// Deletes every non-predefined network without members. Returns the
    /// names of the deleted networks.
    pub fn prune_networks(&self) -> Vec<String> {
        let mut deleted = Vec::new();
        for netw in self.registry.networks() {
            if !netw.is_predefined() && netw.members().is_empty() {
                self.registry.delete_network(&netw.id);
                deleted.push(netw.name.clone());
            }
        }
        deleted
    }

    // ---- exec ----

    /// Registers an exec session against a running container.
    pub fn create_exec(
        &self,
        container_key: &str,
        cmd: Vec<String>,
        stdout: bool,
        stderr: bool,
    ) -> Result<Arc<ExecSession>> {
        let tainr = self.registry.container(container_key)?;
        self.bridge.create_exec(&tainr, cmd, stdout, stderr)
    }

    /// Runs a created exec session to completion.
    pub async fn run_exec(&self, exec_id: &str) -> Result<ExecOutput> {
        self.bridge.run_exec(exec_id).await
    }

    /// Looks up an exec session.
    pub fn exec_session(&self, exec_id: &str) -> Result<Arc<ExecSession>> {
        self.registry.exec(exec_id)
    }

    // ---- logs ----

    /// Opens the container's log stream.
    pub async fn container_logs(
        &self,
        key: &str,
        follow: bool,
        tail_lines: Option<i64>,
    ) -> Result<LogStream> {
        let tainr = self.registry.container(key)?;
        self.bridge.stream_logs(&tainr, follow, tail_lines).await
    }

    // ---- archives ----

    /// Delivers a tar archive into the container at `path`. Before start
    /// the archive is queued and delivered with the mounts; on a running
    /// container it is extracted immediately.
    pub async fn put_archive(&self, key: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let tainr = self.registry.container(key)?;
        match tainr.state() {
            ContainerState::Running => {
                crate::kube::copy::copy_archive_to(&*self.orchestrator, &tainr.pod_name(), archive, path)
                    .await
                    .map_err(|err| Error::orchestrator(&tainr.id, "archive", err))
            }
            state if state.is_terminal() => Err(Error::NotRunning {
                id: tainr.id.clone(),
            }),
            _ => {
                tainr.add_pre_archive(path, archive);
                Ok(())
            }
        }
    }

    /// Reads a path out of a running container as a tar archive.
    pub async fn get_archive(&self, key: &str, path: &str) -> Result<Vec<u8>> {
        let tainr = self.registry.container(key)?;
        if tainr.state() != ContainerState::Running {
            return Err(Error::NotRunning {
                id: tainr.id.clone(),
            });
        }
        crate::kube::copy::copy_archive_from(&*self.orchestrator, &tainr.pod_name(), path)
            .await
            .map_err(|err| Error::orchestrator(&tainr.id, "archive", err))
    }

    /// True when the path exists inside the running container.
    pub async fn path_exists(&self, key: &str, path: &str) -> Result<bool> {
        let tainr = self.registry.container(key)?;
        if tainr.state() != ContainerState::Running {
            return Err(Error::NotRunning {
                id: tainr.id.clone(),
            });
        }
        crate::kube::copy::path_exists(&*self.orchestrator, &tainr.pod_name(), path)
            .await
            .map_err(|err| Error::orchestrator(&tainr.id, "archive", err))
    }

    // ---- housekeeping ----

    /// Runs the reaper until shutdown: one sweep per interval, removing
    /// aged containers and exec sessions and cluster resources no live
    /// record points at.
    pub async fn run_reaper(
        self: Arc<Self>,
        max_age: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(REAP_INTERVAL) => {}
                _ = shutdown.changed() => return,
            }
            self.reap(max_age).await;
        }
    }

    /// One reaper sweep. A container or exec session older than
    /// `max_age` is removed; labeled cluster resources whose container id
    /// is unknown (left behind by a crashed run) are deleted.
    pub async fn reap(&self, max_age: std::time::Duration) {
        let aged = |created: chrono::DateTime<chrono::Utc>| {
            chrono::Utc::now()
                .signed_duration_since(created)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false)
        };

        for tainr in self.registry.containers() {
            if aged(tainr.created_at) {
                info!(id = %tainr.short_id, "reaping aged container");
                if let Err(err) = self.controller.remove(&tainr).await {
                    warn!(id = %tainr.short_id, error = %err, "reap failed");
                }
            }
        }

        for exec in self.registry.execs() {
            if aged(exec.created_at) {
                self.registry.delete_exec(&exec.id);
            }
        }

        match self
            .orchestrator
            .labeled_values(&managed_selector(), LABEL_CONTAINER_ID)
            .await
        {
            Ok(ids) => {
                let known: std::collections::BTreeSet<String> = self
                    .registry
                    .containers()
                    .iter()
                    .map(|t| t.short_id.clone())
                    .collect();
                for short in ids {
                    if known.contains(&short) {
                        continue;
                    }
                    warn!(id = %short, "sweeping orphaned resources");
                    if let Err(err) = self
                        .orchestrator
                        .delete_labeled(&container_selector(&short))
                        .await
                    {
                        warn!(id = %short, error = %err, "orphan sweep failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "orphan listing failed"),
        }
    }

    /// Deletes every cluster resource this process created. Used on
    /// shutdown; failures are logged, not surfaced.
    pub async fn purge(&self) {
        if let Err(err) = self.orchestrator.delete_labeled(&managed_selector()).await {
            warn!(error = %err, "shutdown purge incomplete, resources may be leaked");
            return;
        }
        match self.orchestrator.count_labeled(&managed_selector()).await {
            Ok(0) | Err(_) => {}
            Ok(count) => warn!(count, "resources still present after purge"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::mock::MockOrchestrator;
    use std::time::Duration;

    fn backend() -> (Arc<MockOrchestrator>, Backend, watch::Sender<bool>) {
        let orch = Arc::new(MockOrchestrator::new());
        let (tx, rx) = watch::channel(false);
        let config = Config {
            start_timeout_secs: 5,
            ..Config::default()
        };
        let backend = Backend::new(&config, Arc::clone(&orch) as Arc<dyn Orchestrator>, rx);
        (orch, backend, tx)
    }

    fn web_spec() -> ContainerSpec {
        ContainerSpec {
            image: "nginx:alpine".into(),
            exposed_ports: vec![80],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_container_round_trip() {
        let (orch, backend, _tx) = backend();

        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        assert_eq!(tainr.state(), ContainerState::Created);
        assert!(backend.network("bridge").unwrap().members().contains(&tainr.id));

        backend.start_container(&tainr.id).await.unwrap();
        assert_eq!(tainr.state(), ContainerState::Running);

        backend.remove_container(&tainr.id).await.unwrap();
        assert!(backend.container(&tainr.id).is_err());
        assert!(orch.resources().iter().all(|r| r.kind != "pod"));
    }

    #[tokio::test]
    async fn test_lookup_by_short_id_and_name() {
        let (_orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();

        assert_eq!(backend.container(&tainr.short_id).unwrap().id, tainr.id);
        assert_eq!(backend.container("web").unwrap().id, tainr.id);
        assert!(backend.container("nope").is_err());
    }

    #[tokio::test]
    async fn test_network_management() {
        let (_orch, backend, _tx) = backend();

        let netw = backend.create_network("testnet").unwrap();
        assert!(backend.create_network("testnet").is_err());
        assert!(backend.delete_network("bridge").is_err());

        let tainr = backend.create_container("db", web_spec(), &[]).unwrap();
        backend.connect_network("testnet", &tainr.id).await.unwrap();
        assert!(backend.delete_network("testnet").is_err());

        backend.disconnect_network("testnet", &tainr.id).await.unwrap();
        backend.delete_network("testnet").unwrap();
        assert!(backend.network(&netw.id).is_err());
    }

    #[tokio::test]
    async fn test_prune_spares_predefined_and_populated() {
        let (_orch, backend, _tx) = backend();
        backend.create_network("idle").unwrap();
        backend.create_network("busy").unwrap();
        let tainr = backend.create_container("db", web_spec(), &[]).unwrap();
        backend.connect_network("busy", &tainr.id).await.unwrap();

        let deleted = backend.prune_networks();

        assert_eq!(deleted, vec!["idle"]);
        assert!(backend.network("busy").is_ok());
        assert!(backend.network("bridge").is_ok());
    }

    #[tokio::test]
    async fn test_wait_returns_after_stop() {
        let (_orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        backend.start_container(&tainr.id).await.unwrap();

        let (code, _) = tokio::join!(backend.wait_container(&tainr.id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            backend.stop_container(&tainr.id).await.unwrap();
        });
        assert_eq!(code.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pre_start_archive_is_queued() {
        let (orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();

        backend
            .put_archive(&tainr.id, "/data", b"not-really-tar".to_vec())
            .await
            .unwrap();

        assert_eq!(tainr.pre_archives().len(), 1);
        assert!(orch.recorded_execs().is_empty());
    }

    #[tokio::test]
    async fn test_running_archive_is_copied_directly() {
        let (orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        backend.start_container(&tainr.id).await.unwrap();

        backend
            .put_archive(&tainr.id, "/data", b"bytes".to_vec())
            .await
            .unwrap();

        let execs = orch.recorded_execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0][0], "tar");
    }

    #[tokio::test]
    async fn test_archive_read_requires_running() {
        let (_orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        let err = backend.get_archive(&tainr.id, "/data").await.unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_reap_removes_aged_containers_and_execs() {
        let (orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        backend.start_container(&tainr.id).await.unwrap();
        let exec = backend
            .create_exec(&tainr.id, vec!["true".into()], true, true)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        backend.reap(Duration::ZERO).await;

        assert!(backend.container(&tainr.id).is_err());
        assert!(backend.exec_session(&exec.id).is_err());
        assert!(orch.resources().is_empty());
    }

    #[tokio::test]
    async fn test_reap_spares_fresh_containers() {
        let (orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        backend.start_container(&tainr.id).await.unwrap();

        backend.reap(Duration::from_secs(3600)).await;

        assert!(backend.container(&tainr.id).is_ok());
        assert!(orch.resources().iter().any(|r| r.kind == "pod"));
    }

    #[tokio::test]
    async fn test_reap_sweeps_orphaned_resources() {
        let (orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        backend.start_container(&tainr.id).await.unwrap();

        // A pod from a previous run: managed label, unknown container id.
        let orphan = k8s_openapi::api::core::v1::Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("podbridge-stale".to_string()),
                labels: Some(
                    [
                        (mapper::LABEL_MANAGED.to_string(), "true".to_string()),
                        (LABEL_CONTAINER_ID.to_string(), "deadbeefcafe".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        orch.create_pod(&orphan).await.unwrap();

        backend.reap(Duration::from_secs(3600)).await;

        assert!(orch.resources().iter().all(|r| r.name != "podbridge-stale"));
        assert!(orch
            .resources()
            .iter()
            .any(|r| r.name == tainr.pod_name()));
    }

    #[tokio::test]
    async fn test_purge_deletes_all_managed_resources() {
        let (orch, backend, _tx) = backend();
        let tainr = backend.create_container("web", web_spec(), &[]).unwrap();
        backend.start_container(&tainr.id).await.unwrap();

        backend.purge().await;

        assert!(orch.resources().is_empty());
    }
}
