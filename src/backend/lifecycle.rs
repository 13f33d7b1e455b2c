//! Container lifecycle.
//!
//! One controller owns every state transition. A per-instance guard makes
//! the start path single-writer: a second start while one is in flight is
//! rejected, a stop waits for the in-flight start and then tears down.
//! The guard is never held across an orchestrator call on behalf of a
//! different instance, so containers start and stop independently.
//!
//! Cluster submission retries transient failures with bounded exponential
//! backoff; fatal failures and exhausted retries move the instance to
//! `Failed` and tear down whatever was already created.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, OrchestratorError, Result};
use crate::kube::{Orchestrator, WorkloadStatus};
use crate::model::{Container, ContainerState, Registry, WaitPolicy};

use super::mapper::{container_selector, ResourceMapper};
use super::mounts::MountMaterializer;
use super::network::AliasResolver;
use super::ports::PortAllocator;

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives containers through their lifecycle.
pub struct LifecycleController {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<Registry>,
    mapper: ResourceMapper,
    materializer: MountMaterializer,
    ports: Arc<PortAllocator>,
    resolver: Arc<AliasResolver>,
    start_timeout: Duration,
    ready_requires_mounts: bool,
    poll_interval: Duration,
    guards: DashMap<String, Arc<Mutex<()>>>,
    shutdown: watch::Receiver<bool>,
}

impl LifecycleController {
    /// Creates a controller. `shutdown` flipping to true cancels in-flight
    /// start waits.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<Registry>,
        mapper: ResourceMapper,
        materializer: MountMaterializer,
        ports: Arc<PortAllocator>,
        resolver: Arc<AliasResolver>,
        start_timeout: Duration,
        ready_requires_mounts: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            mapper,
            materializer,
            ports,
            resolver,
            start_timeout,
            ready_requires_mounts,
            poll_interval: POLL_INTERVAL,
            guards: DashMap::new(),
            shutdown,
        }
    }

    /// Status poll interval; shortened in tests.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn guard(&self, id: &str) -> Arc<Mutex<()>> {
        self.guards
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Starts a container: plans mounts, submits resources, waits for the
    /// workload and publishes ports. A start already in flight for the
    /// same id is rejected; a container that is already active is left
    /// alone.
    pub async fn start(&self, tainr: &Arc<Container>) -> Result<()> {
        let guard = self.guard(&tainr.id);
        let Ok(_permit) = guard.try_lock() else {
            return Err(Error::AlreadyStarting {
                id: tainr.id.clone(),
            });
        };
        if tainr.state().is_active() {
            return Ok(());
        }

        tainr.set_state(ContainerState::Pending);
        match self.start_inner(tainr).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail_and_teardown(tainr, &err).await;
                Err(err)
            }
        }
    }

    async fn start_inner(&self, tainr: &Arc<Container>) -> Result<()> {
        let plan = self
            .materializer
            .plan(&tainr.spec.mounts, &tainr.pre_archives())?;
        let bundle = self.mapper.map(tainr, &plan)?;

        let mut config_map_names = Vec::new();
        for cm in &bundle.config_maps {
            self.with_retry(&tainr.id, "submit", || {
                self.orchestrator.create_config_map(cm)
            })
            .await?;
            if let Some(name) = &cm.metadata.name {
                config_map_names.push(name.clone());
            }
        }
        self.with_retry(&tainr.id, "submit", || {
            self.orchestrator.create_pod(&bundle.pod)
        })
        .await?;
        tainr.record_resources(&[], &config_map_names);
        tainr.set_state(ContainerState::Scheduled);
        debug!(id = %tainr.short_id, pod = %tainr.pod_name(), "resources submitted");

        for netw_id in tainr.networks() {
            let netw = self.registry.network(&netw_id)?;
            self.resolver.join(&netw, tainr).await?;
        }

        let mapping = self.ports.allocate(tainr).await?;

        if let WorkloadStatus::Completed = self.await_workload(tainr).await? {
            // Short-lived workload that already ran to completion.
            tainr.publish_ports(&mapping);
            tainr.set_state(ContainerState::Running);
            tainr.set_state(ContainerState::Stopped);
            info!(id = %tainr.short_id, "workload completed during start");
            return Ok(());
        }

        let gate_on_mounts =
            self.ready_requires_mounts || tainr.spec.wait == WaitPolicy::MountedContent;
        if plan.has_post_start() && gate_on_mounts {
            self.materializer
                .copy_post_start(&*self.orchestrator, &tainr.id, &tainr.pod_name(), &plan)
                .await?;
        }

        tainr.publish_ports(&mapping);
        tainr.set_state(ContainerState::Running);
        info!(id = %tainr.short_id, pod = %tainr.pod_name(), "container running");

        if plan.has_post_start() && !gate_on_mounts {
            if let Err(err) = self
                .materializer
                .copy_post_start(&*self.orchestrator, &tainr.id, &tainr.pod_name(), &plan)
                .await
            {
                warn!(id = %tainr.short_id, error = %err, "post-start mount copy failed");
            }
        }
        Ok(())
    }

    /// Polls the workload until it is running or completed, bounded by the
    /// start timeout and the shutdown signal.
    async fn await_workload(&self, tainr: &Arc<Container>) -> Result<WorkloadStatus> {
        let deadline = Instant::now() + self.start_timeout;
        let mut shutdown = self.shutdown.clone();
        let pod_name = tainr.pod_name();
        loop {
            let status = self
                .with_retry(&tainr.id, "status", || {
                    self.orchestrator.workload_status(&pod_name)
                })
                .await?;
            match status {
                WorkloadStatus::Running | WorkloadStatus::Completed => return Ok(status),
                WorkloadStatus::Failed(reason) => {
                    return Err(Error::orchestrator(
                        &tainr.id,
                        "start",
                        OrchestratorError::fatal(reason),
                    ));
                }
                WorkloadStatus::Pending => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::StartTimeout {
                    id: tainr.id.clone(),
                    timeout: self.start_timeout,
                });
            }
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    return Err(Error::Cancelled { id: tainr.id.clone() });
                }
            }
        }
    }

    /// Stops a container: releases endpoints, suspends its aliases and
    /// deletes the labeled resources. Network membership survives a stop
    /// so a restart rejoins the same networks; only [`Self::remove`] and
    /// an explicit disconnect drop it. Idempotent; waits for an in-flight
    /// start.
    pub async fn stop(&self, tainr: &Arc<Container>) -> Result<()> {
        let guard = self.guard(&tainr.id);
        let _permit = guard.lock().await;

        if tainr.state().is_terminal() {
            return Ok(());
        }

        self.ports.release(&tainr.id);

        for netw_id in tainr.networks() {
            match self.registry.network(&netw_id) {
                Ok(netw) => {
                    if let Err(err) = self.resolver.suspend(&netw, tainr).await {
                        warn!(id = %tainr.short_id, network = %netw.name, error = %err, "alias teardown failed");
                    }
                }
                Err(_) => debug!(id = %tainr.short_id, network = %netw_id, "network already gone"),
            }
        }

        let selector = container_selector(&tainr.short_id);
        if let Err(err) = self.orchestrator.delete_labeled(&selector).await {
            warn!(id = %tainr.short_id, error = %err, "resource teardown failed, resources may be leaked");
        }

        tainr.set_state(ContainerState::Stopped);
        info!(id = %tainr.short_id, "container stopped");
        Ok(())
    }

    /// Stops the container if needed, leaves its networks and drops it
    /// from the registry.
    pub async fn remove(&self, tainr: &Arc<Container>) -> Result<()> {
        if !tainr.state().is_terminal() {
            self.stop(tainr).await?;
        }
        for netw_id in tainr.networks() {
            if let Ok(netw) = self.registry.network(&netw_id) {
                if let Err(err) = self.resolver.leave(&netw, tainr).await {
                    warn!(id = %tainr.short_id, network = %netw.name, error = %err, "network leave failed");
                }
            }
        }
        self.guards.remove(&tainr.id);
        self.registry.delete_container(&tainr.id);
        Ok(())
    }

    async fn fail_and_teardown(&self, tainr: &Arc<Container>, err: &Error) {
        tainr.set_last_error(&err.to_string());
        self.ports.release(&tainr.id);

        // Aliases are freed but membership stays, mirroring stop.
        for netw_id in tainr.networks() {
            if let Ok(netw) = self.registry.network(&netw_id) {
                netw.release_aliases(&tainr.id);
            }
        }

        let selector = container_selector(&tainr.short_id);
        if let Err(del_err) = self.orchestrator.delete_labeled(&selector).await {
            warn!(id = %tainr.short_id, error = %del_err, "teardown after failed start incomplete");
        }
        tainr.set_state(ContainerState::Failed);
        warn!(id = %tainr.short_id, error = %err, "container failed");
    }

    /// Runs an orchestrator call, retrying transient failures with
    /// exponential backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        id: &str,
        phase: &'static str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OrchestratorError>>,
    {
        let mut backoff = RETRY_BASE;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                    warn!(id = %crate::model::short_id(id), phase, attempt, error = %err, "orchestrator call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                    attempt += 1;
                }
                Err(err) => return Err(Error::orchestrator(id, phase, err)),
            }
        }
    }
}
