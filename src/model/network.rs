//! Virtual network bookkeeping.
//!
//! A network groups container instances that can resolve one another by
//! alias. The alias table is the in-memory source of truth; the alias
//! resolver materializes it as service objects.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use super::container::{generate_id, short_id};
use crate::error::{Error, Result};

/// A logical container network, scoped to one test run.
#[derive(Debug)]
pub struct Network {
    /// Opaque 64-hex id.
    pub id: String,
    /// 12-hex short id.
    pub short_id: String,
    /// Network name; `bridge`, `host` and `null` are predefined.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    members: RwLock<BTreeSet<String>>,
    aliases: RwLock<BTreeMap<String, String>>,
}

impl Network {
    /// Creates a new network with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let id = generate_id();
        Self {
            short_id: short_id(&id),
            id,
            name: name.into(),
            created_at: Utc::now(),
            members: RwLock::new(BTreeSet::new()),
            aliases: RwLock::new(BTreeMap::new()),
        }
    }

    /// True for the predefined system networks.
    #[must_use]
    pub fn is_predefined(&self) -> bool {
        matches!(self.name.as_str(), "bridge" | "host" | "null")
    }

    /// Adds a member container.
    pub fn add_member(&self, container_id: &str) {
        self.members.write().insert(container_id.to_string());
    }

    /// Removes a member container; returns true when it was the last one.
    pub fn remove_member(&self, container_id: &str) -> bool {
        let mut members = self.members.write();
        members.remove(container_id);
        members.is_empty()
    }

    /// Current member container ids.
    #[must_use]
    pub fn members(&self) -> BTreeSet<String> {
        self.members.read().clone()
    }

    /// Claims an alias for a container. An alias is unique within the
    /// network at any instant; re-claiming by the same holder is a no-op.
    pub fn claim_alias(&self, alias: &str, container_id: &str) -> Result<()> {
        let mut aliases = self.aliases.write();
        if let Some(holder) = aliases.get(alias) {
            if holder != container_id {
                return Err(Error::AliasConflict {
                    alias: alias.to_string(),
                    network: self.name.clone(),
                });
            }
            return Ok(());
        }
        aliases.insert(alias.to_string(), container_id.to_string());
        Ok(())
    }

    /// Releases every alias held by the given container, returning them.
    pub fn release_aliases(&self, container_id: &str) -> Vec<String> {
        let mut aliases = self.aliases.write();
        let released: Vec<String> = aliases
            .iter()
            .filter(|(_, holder)| holder.as_str() == container_id)
            .map(|(alias, _)| alias.clone())
            .collect();
        for alias in &released {
            aliases.remove(alias);
        }
        released
    }

    /// Container currently holding the given alias, if any.
    #[must_use]
    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        self.aliases.read().get(alias).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_networks() {
        assert!(Network::new("bridge").is_predefined());
        assert!(Network::new("host").is_predefined());
        assert!(!Network::new("test-net").is_predefined());
    }

    #[test]
    fn test_alias_uniqueness() {
        let netw = Network::new("test-net");
        netw.claim_alias("db", "c1").unwrap();
        // same holder may re-claim
        netw.claim_alias("db", "c1").unwrap();
        let err = netw.claim_alias("db", "c2").unwrap_err();
        assert!(matches!(err, Error::AliasConflict { .. }));
    }

    #[test]
    fn test_alias_reusable_after_release() {
        let netw = Network::new("test-net");
        netw.claim_alias("db", "c1").unwrap();
        let released = netw.release_aliases("c1");
        assert_eq!(released, vec!["db".to_string()]);
        netw.claim_alias("db", "c2").unwrap();
        assert_eq!(netw.resolve_alias("db"), Some("c2".to_string()));
    }

    #[test]
    fn test_last_member_detection() {
        let netw = Network::new("test-net");
        netw.add_member("c1");
        netw.add_member("c2");
        assert!(!netw.remove_member("c1"));
        assert!(netw.remove_member("c2"));
    }
}
