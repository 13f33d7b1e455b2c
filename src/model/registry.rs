//! In-memory registry of containers, networks and exec sessions.
//!
//! Plays the role of the engine database: everything is addressable by
//! full id, short id prefix, or name. Lock scope is a single map entry;
//! no registry lock is ever held across an orchestrator call.

use dashmap::DashMap;
use std::sync::Arc;

use super::container::Container;
use super::exec::ExecSession;
use super::network::Network;
use crate::error::{Error, Result};

/// Shared registry handle.
#[derive(Debug, Default)]
pub struct Registry {
    containers: DashMap<String, Arc<Container>>,
    networks: DashMap<String, Arc<Network>>,
    execs: DashMap<String, Arc<ExecSession>>,
}

impl Registry {
    /// Creates a registry with the predefined networks seeded.
    #[must_use]
    pub fn new() -> Self {
        let reg = Self::default();
        for name in ["bridge", "host", "null"] {
            reg.save_network(Arc::new(Network::new(name)));
        }
        reg
    }

    /// Stores a container.
    pub fn save_container(&self, tainr: Arc<Container>) {
        self.containers.insert(tainr.id.clone(), tainr);
    }

    /// Resolves a container by full id, short id prefix, or name.
    pub fn container(&self, key: &str) -> Result<Arc<Container>> {
        if let Some(tainr) = self.containers.get(key) {
            return Ok(tainr.clone());
        }
        self.containers
            .iter()
            .find(|entry| {
                let tainr = entry.value();
                (!key.is_empty() && tainr.id.starts_with(key)) || tainr.name() == key
            })
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound {
                kind: "container",
                id: key.to_string(),
            })
    }

    /// All stored containers.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.containers.iter().map(|e| e.value().clone()).collect()
    }

    /// Removes a container record.
    pub fn delete_container(&self, id: &str) {
        self.containers.remove(id);
    }

    /// Stores a network.
    pub fn save_network(&self, netw: Arc<Network>) {
        self.networks.insert(netw.id.clone(), netw);
    }

    /// Resolves a network by full id, short id prefix, or name.
    pub fn network(&self, key: &str) -> Result<Arc<Network>> {
        if let Some(netw) = self.networks.get(key) {
            return Ok(netw.clone());
        }
        self.networks
            .iter()
            .find(|entry| {
                let netw = entry.value();
                (!key.is_empty() && netw.id.starts_with(key)) || netw.name == key
            })
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound {
                kind: "network",
                id: key.to_string(),
            })
    }

    /// All stored networks.
    #[must_use]
    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.networks.iter().map(|e| e.value().clone()).collect()
    }

    /// Removes a network record.
    pub fn delete_network(&self, id: &str) {
        self.networks.remove(id);
    }

    /// Stores an exec session.
    pub fn save_exec(&self, exec: Arc<ExecSession>) {
        self.execs.insert(exec.id.clone(), exec);
    }

    /// All stored exec sessions.
    #[must_use]
    pub fn execs(&self) -> Vec<Arc<ExecSession>> {
        self.execs.iter().map(|e| e.value().clone()).collect()
    }

    /// Removes an exec session record.
    pub fn delete_exec(&self, id: &str) {
        self.execs.remove(id);
    }

    /// Resolves an exec session by id.
    pub fn exec(&self, id: &str) -> Result<Arc<ExecSession>> {
        self.execs
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound {
                kind: "exec",
                id: id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::container::ContainerSpec;

    #[test]
    fn test_registry_seeds_predefined_networks() {
        let reg = Registry::new();
        assert!(reg.network("bridge").is_ok());
        assert!(reg.network("host").is_ok());
        assert!(reg.network("null").is_ok());
        assert!(reg.network("custom").is_err());
    }

    #[test]
    fn test_container_lookup_by_short_id_and_name() {
        let reg = Registry::new();
        let tainr = Arc::new(Container::new("web", ContainerSpec::default()));
        let id = tainr.id.clone();
        let short = tainr.short_id.clone();
        reg.save_container(tainr);

        assert_eq!(reg.container(&id).unwrap().id, id);
        assert_eq!(reg.container(&short).unwrap().id, id);
        assert_eq!(reg.container("web").unwrap().id, id);
        assert!(reg.container("nope").is_err());
    }

    #[test]
    fn test_delete_container() {
        let reg = Registry::new();
        let tainr = Arc::new(Container::new("web", ContainerSpec::default()));
        let id = tainr.id.clone();
        reg.save_container(tainr);
        reg.delete_container(&id);
        assert!(reg.container(&id).is_err());
    }
}
