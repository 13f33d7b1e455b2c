//! Alias resolution.
//!
//! Claims network aliases in the in-memory alias table first and only then
//! materializes them as service objects, so a conflicting claim is
//! rejected before any cluster state exists. Leaving releases the claims
//! and deletes the corresponding services with a bounded retry; a service
//! that survives the retries is logged as leaked, never silently dropped.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kube::Orchestrator;
use crate::model::{Container, Network};

use super::mapper::ResourceMapper;

const DELETE_ATTEMPTS: u32 = 3;
const DELETE_BACKOFF: Duration = Duration::from_millis(100);

/// Claims aliases and keeps service objects in sync with them.
pub struct AliasResolver {
    orchestrator: Arc<dyn Orchestrator>,
    mapper: ResourceMapper,
    disable_services: bool,
}

impl AliasResolver {
    /// Creates a resolver building services with the given mapper.
    #[must_use]
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        mapper: ResourceMapper,
        disable_services: bool,
    ) -> Self {
        Self {
            orchestrator,
            mapper,
            disable_services,
        }
    }

    /// Joins a container to a network: membership, alias claims, then the
    /// services publishing those aliases.
    ///
    /// On an alias conflict or a service failure everything this call did
    /// is rolled back and the error is returned; partially joined is not a
    /// state a container can end up in.
    pub async fn join(&self, netw: &Network, tainr: &Container) -> Result<()> {
        let mut claimed: Vec<String> = Vec::new();
        for alias in &tainr.spec.network_aliases {
            if let Err(err) = netw.claim_alias(alias, &tainr.id) {
                if !claimed.is_empty() {
                    netw.release_aliases(&tainr.id);
                    debug!(count = claimed.len(), "alias claims rolled back");
                }
                return Err(err);
            }
            claimed.push(alias.clone());
        }

        netw.add_member(&tainr.id);
        tainr.connect_network(&netw.id);

        if self.disable_services {
            return Ok(());
        }

        let mut created: Vec<String> = Vec::new();
        for alias in &claimed {
            let Some(svc) = self.mapper.alias_service(tainr, alias) else {
                continue;
            };
            let name = svc.metadata.name.clone().unwrap_or_else(|| alias.clone());
            if let Err(err) = self.orchestrator.create_service(&svc).await {
                for name in &created {
                    if let Err(del_err) = self.orchestrator.delete_service(name).await {
                        warn!(service = %name, error = %del_err, "rollback delete failed, resource leaked");
                    }
                }
                netw.release_aliases(&tainr.id);
                netw.remove_member(&tainr.id);
                let _ = tainr.disconnect_network(&netw.id);
                return Err(Error::orchestrator(&tainr.id, "alias-service", err));
            }
            debug!(service = %name, network = %netw.name, "alias service created");
            created.push(name);
        }
        tainr.record_resources(&created, &[]);

        Ok(())
    }

    /// Takes a container's aliases out of service without leaving the
    /// network: claims are released and the alias services deleted, but
    /// the membership bookkeeping survives so a later start rejoins with
    /// the same networks and aliases.
    pub async fn suspend(&self, netw: &Network, tainr: &Container) -> Result<()> {
        let released = netw.release_aliases(&tainr.id);

        if !self.disable_services {
            for alias in &released {
                let name = alias.to_lowercase();
                self.delete_with_retry(&name).await;
            }
        }
        Ok(())
    }

    /// Removes a container from a network, releasing its aliases and
    /// deleting their services. Returns true when the container was the
    /// last member.
    pub async fn leave(&self, netw: &Network, tainr: &Container) -> Result<bool> {
        self.suspend(netw, tainr).await?;
        let last = netw.remove_member(&tainr.id);
        let _ = tainr.disconnect_network(&netw.id);
        Ok(last)
    }

    /// Deletes a service, retrying transient failures a few times. After
    /// the last attempt the resource is reported leaked and the call
    /// returns; teardown must not wedge on a flaky api-server.
    async fn delete_with_retry(&self, name: &str) {
        let mut backoff = DELETE_BACKOFF;
        for attempt in 1..=DELETE_ATTEMPTS {
            match self.orchestrator.delete_service(name).await {
                Ok(()) => {
                    debug!(service = %name, "alias service deleted");
                    return;
                }
                Err(err) if err.is_transient() && attempt < DELETE_ATTEMPTS => {
                    warn!(service = %name, attempt, error = %err, "service delete failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    warn!(service = %name, error = %err, "service delete failed, resource leaked");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::kube::mock::MockOrchestrator;
    use crate::model::ContainerSpec;
    use std::collections::BTreeSet;

    fn aliased(name: &str, aliases: &[&str]) -> Container {
        Container::new(
            name,
            ContainerSpec {
                image: "img".into(),
                exposed_ports: vec![80],
                network_aliases: aliases
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<BTreeSet<_>>(),
                ..Default::default()
            },
        )
    }

    fn resolver(orch: &Arc<MockOrchestrator>, disable_services: bool) -> AliasResolver {
        AliasResolver::new(
            Arc::clone(orch) as Arc<dyn Orchestrator>,
            ResourceMapper::new("default"),
            disable_services,
        )
    }

    #[tokio::test]
    async fn test_join_claims_aliases_and_creates_services() {
        let orch = Arc::new(MockOrchestrator::new());
        let netw = Network::new("testnet");
        let tainr = aliased("db", &["postgres"]);

        resolver(&orch, false).join(&netw, &tainr).await.unwrap();

        assert_eq!(netw.resolve_alias("postgres").as_deref(), Some(tainr.id.as_str()));
        assert!(tainr.networks().contains(&netw.id));
        let services: Vec<_> = orch
            .resources()
            .into_iter()
            .filter(|r| r.kind == "service")
            .collect();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "postgres");
        assert_eq!(tainr.resources().services, vec!["postgres"]);
    }

    #[tokio::test]
    async fn test_alias_conflict_is_rejected() {
        let orch = Arc::new(MockOrchestrator::new());
        let resolver = resolver(&orch, false);
        let netw = Network::new("testnet");
        let first = aliased("db1", &["postgres"]);
        let second = aliased("db2", &["postgres"]);

        resolver.join(&netw, &first).await.unwrap();
        let err = resolver.join(&netw, &second).await.unwrap_err();

        assert!(matches!(err, Error::AliasConflict { .. }));
        assert_eq!(netw.resolve_alias("postgres").as_deref(), Some(first.id.as_str()));
        assert!(!netw.members().contains(&second.id));
    }

    #[tokio::test]
    async fn test_service_failure_rolls_back_join() {
        let orch = Arc::new(MockOrchestrator::new());
        orch.fail_next_service_create(OrchestratorError::fatal("denied"));
        let netw = Network::new("testnet");
        let tainr = aliased("db", &["postgres"]);

        let err = resolver(&orch, false).join(&netw, &tainr).await.unwrap_err();

        assert!(matches!(err, Error::Orchestrator { .. }));
        assert!(netw.resolve_alias("postgres").is_none());
        assert!(netw.members().is_empty());
        assert!(!tainr.networks().contains(&netw.id));
    }

    #[tokio::test]
    async fn test_leave_deletes_services_and_reports_last() {
        let orch = Arc::new(MockOrchestrator::new());
        let resolver = resolver(&orch, false);
        let netw = Network::new("testnet");
        let tainr = aliased("db", &["postgres"]);

        resolver.join(&netw, &tainr).await.unwrap();
        let last = resolver.leave(&netw, &tainr).await.unwrap();

        assert!(last);
        assert!(netw.resolve_alias("postgres").is_none());
        assert!(orch
            .resources()
            .iter()
            .all(|r| r.kind != "service"));
    }

    #[tokio::test]
    async fn test_suspend_keeps_membership() {
        let orch = Arc::new(MockOrchestrator::new());
        let resolver = resolver(&orch, false);
        let netw = Network::new("testnet");
        let tainr = aliased("db", &["postgres"]);

        resolver.join(&netw, &tainr).await.unwrap();
        resolver.suspend(&netw, &tainr).await.unwrap();

        assert!(netw.resolve_alias("postgres").is_none());
        assert!(orch.resources().iter().all(|r| r.kind != "service"));
        assert!(netw.members().contains(&tainr.id));
        assert!(tainr.networks().contains(&netw.id));

        // rejoining brings the alias and its service back
        resolver.join(&netw, &tainr).await.unwrap();
        assert_eq!(netw.resolve_alias("postgres").as_deref(), Some(tainr.id.as_str()));
        assert!(orch.resources().iter().any(|r| r.name == "postgres"));
    }

    #[tokio::test]
    async fn test_alias_is_free_again_after_leave() {
        let orch = Arc::new(MockOrchestrator::new());
        let resolver = resolver(&orch, false);
        let netw = Network::new("testnet");
        let first = aliased("db1", &["postgres"]);
        let second = aliased("db2", &["postgres"]);

        resolver.join(&netw, &first).await.unwrap();
        resolver.leave(&netw, &first).await.unwrap();
        resolver.join(&netw, &second).await.unwrap();

        assert_eq!(
            netw.resolve_alias("postgres").as_deref(),
            Some(second.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_leave_survives_persistent_delete_failure() {
        let orch = Arc::new(MockOrchestrator::new());
        let resolver = resolver(&orch, false);
        let netw = Network::new("testnet");
        let tainr = aliased("db", &["postgres"]);

        resolver.join(&netw, &tainr).await.unwrap();
        orch.fail_next_service_delete(OrchestratorError::fatal("denied"));
        let last = resolver.leave(&netw, &tainr).await.unwrap();

        assert!(last);
        assert!(netw.resolve_alias("postgres").is_none());
    }

    #[tokio::test]
    async fn test_disabled_services_still_claim_aliases() {
        let orch = Arc::new(MockOrchestrator::new());
        let netw = Network::new("testnet");
        let tainr = aliased("db", &["postgres"]);

        resolver(&orch, true).join(&netw, &tainr).await.unwrap();

        assert_eq!(netw.resolve_alias("postgres").as_deref(), Some(tainr.id.as_str()));
        assert!(orch.resources().is_empty());
    }
}
