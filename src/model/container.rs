//! Container specification and instance bookkeeping.
//!
//! A [`ContainerSpec`] is immutable once submitted; the [`Container`]
//! instance wraps it with the lifecycle state and the orchestrator resource
//! names assigned along the way. The instance is owned by the lifecycle
//! controller; everything else reads it through the registry by id.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Label translated into a pod image pull policy.
pub const LABEL_PULL_POLICY: &str = "io.podbridge.pull-policy";
/// Label translated into cpu request/limit.
pub const LABEL_REQUEST_CPU: &str = "io.podbridge.request-cpu";
/// Label translated into memory request/limit.
pub const LABEL_REQUEST_MEMORY: &str = "io.podbridge.request-memory";
/// Label enforcing a service account for the created pod.
pub const LABEL_SERVICE_ACCOUNT: &str = "io.podbridge.service-account";
/// Label enforcing a numeric runAsUser for the created pod.
pub const LABEL_RUNAS_USER: &str = "io.podbridge.runas-user";

/// Lifecycle state of a container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    /// Created via the API, not yet started.
    Created,
    /// Start accepted, resources not yet submitted.
    Pending,
    /// Resources submitted, waiting for the workload to come up.
    Scheduled,
    /// Workload is up and reachable.
    Running,
    /// Stopped, resources released. Terminal together with `Failed`.
    Stopped,
    /// Unrecoverable failure; resources cleaned up best-effort. Terminal.
    Failed,
}

impl ContainerState {
    /// True for states in which the workload may still produce output.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled | Self::Running)
    }

    /// True for `Stopped` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Docker-style state string used in list/inspect responses.
    #[must_use]
    pub fn state_string(self) -> &'static str {
        match self {
            Self::Running => "Up",
            Self::Stopped => "Exited",
            Self::Failed => "Dead",
            Self::Created | Self::Pending | Self::Scheduled => "Created",
        }
    }
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    /// Mounted read-only.
    ReadOnly,
    /// Mounted read-write.
    ReadWrite,
}

/// What the mount source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountKind {
    /// A single file.
    File,
    /// A directory tree.
    Directory,
}

/// A declared bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Source path on the host running the facade.
    pub source: PathBuf,
    /// Absolute target path inside the container.
    pub target: String,
    /// Access mode.
    pub mode: MountMode,
    /// File or directory, as observed when the container was created.
    pub kind: MountKind,
}

impl Mount {
    /// Parses a Docker bind string (`/src:/dst` or `/src:/dst:ro`).
    pub fn parse_bind(bind: &str) -> Result<Self> {
        let parts: Vec<&str> = bind.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(Error::InvalidSpec {
                reason: format!("could not parse bind `{bind}`"),
            });
        }
        let mode = match parts.get(2) {
            Some(&"ro") => MountMode::ReadOnly,
            _ => MountMode::ReadWrite,
        };
        let source = PathBuf::from(parts[0]);
        let kind = match std::fs::metadata(&source) {
            Ok(meta) if meta.is_dir() => MountKind::Directory,
            _ => MountKind::File,
        };
        Ok(Self {
            source,
            target: parts[1].to_string(),
            mode,
            kind,
        })
    }
}

/// Wait policy applied when deciding that a started container is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WaitPolicy {
    /// Ready as soon as the main process is observably alive.
    #[default]
    Running,
    /// Ready only once post-start mount copies have completed as well.
    MountedContent,
}

/// Immutable description of a container, assembled from a create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Entrypoint override; empty means image default.
    pub entrypoint: Vec<String>,
    /// Command arguments; empty means image default.
    pub cmd: Vec<String>,
    /// Environment; keys are unique per container.
    pub env: BTreeMap<String, String>,
    /// Declared exposed tcp ports, in request order. Duplicates are
    /// rejected by the resource mapper.
    pub exposed_ports: Vec<u16>,
    /// Declared bind mounts, in request order.
    pub mounts: Vec<Mount>,
    /// DNS aliases the container is reachable under inside its networks.
    pub network_aliases: BTreeSet<String>,
    /// Free-form labels; `io.podbridge.*` keys tune pod settings.
    pub labels: BTreeMap<String, String>,
    /// Readiness decision policy.
    pub wait: WaitPolicy,
}

/// Parses a Docker port key such as `9000/tcp` into a port number.
///
/// A missing protocol suffix defaults to tcp; anything else is rejected.
pub fn parse_tcp_port(raw: &str) -> Result<u16> {
    let mut it = raw.splitn(2, '/');
    let num = it.next().unwrap_or_default();
    let port: u16 = num.parse().map_err(|_| Error::InvalidSpec {
        reason: format!("could not parse exposed port `{raw}`"),
    })?;
    match it.next() {
        None | Some("tcp") => Ok(port),
        Some(proto) => Err(Error::InvalidSpec {
            reason: format!("unsupported protocol `{proto}` for port {port}, only tcp is supported"),
        }),
    }
}

/// Generates an opaque 64 character hex id, Docker style.
#[must_use]
pub fn generate_id() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Truncates a full id to the 12 character short form.
#[must_use]
pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

/// A tar archive queued for delivery into the container at a target path
/// before (or right after) start.
#[derive(Debug, Clone)]
pub struct PreArchive {
    /// Extraction target inside the container.
    pub target: String,
    /// Raw tar bytes.
    pub archive: Vec<u8>,
}

/// Orchestrator resource names assigned to a container instance.
#[derive(Debug, Clone, Default)]
pub struct AssignedResources {
    /// Names of alias services created for this container.
    pub services: Vec<String>,
    /// Names of config maps created for this container.
    pub config_maps: Vec<String>,
}

/// A container instance: spec plus mutable lifecycle bookkeeping.
///
/// State transitions go through a watch channel so log streams and wait
/// calls can observe them without polling the registry.
#[derive(Debug)]
pub struct Container {
    /// Opaque 64-hex id.
    pub id: String,
    /// 12-hex short id, used in resource labels.
    pub short_id: String,
    name: RwLock<String>,
    /// The owning immutable spec.
    pub spec: ContainerSpec,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    state_tx: watch::Sender<ContainerState>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    resources: RwLock<AssignedResources>,
    networks: RwLock<BTreeSet<String>>,
    port_mapping: RwLock<BTreeMap<u16, u16>>,
    pre_archives: RwLock<Vec<PreArchive>>,
    last_error: RwLock<Option<String>>,
}

impl Container {
    /// Creates a new instance in the `Created` state with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: ContainerSpec) -> Self {
        let id = generate_id();
        let short = short_id(&id);
        let mut name = name.into();
        if name.is_empty() {
            name = short.clone();
        }
        let (state_tx, _) = watch::channel(ContainerState::Created);
        Self {
            short_id: short,
            id,
            name: RwLock::new(name),
            spec,
            created_at: Utc::now(),
            state_tx,
            started_at: RwLock::new(None),
            finished_at: RwLock::new(None),
            resources: RwLock::new(AssignedResources::default()),
            networks: RwLock::new(BTreeSet::new()),
            port_mapping: RwLock::new(BTreeMap::new()),
            pre_archives: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
        }
    }

    /// Client-facing name, possibly empty.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Renames the container. The pod name is derived at start, so a
    /// rename before start is fully reflected in the cluster.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        *self.state_tx.borrow()
    }

    /// Moves the instance to a new state and notifies watchers.
    pub fn set_state(&self, state: ContainerState) {
        match state {
            ContainerState::Running => *self.started_at.write() = Some(Utc::now()),
            ContainerState::Stopped | ContainerState::Failed => {
                *self.finished_at.write() = Some(Utc::now());
            }
            _ => {}
        }
        self.state_tx.send_replace(state);
    }

    /// Subscribes to state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ContainerState> {
        self.state_tx.subscribe()
    }

    /// DNS-compatible pod name derived from the container name and id.
    #[must_use]
    pub fn pod_name(&self) -> String {
        let mut name = format!("podbridge-{}", self.name().replace('_', "-"));
        name.retain(|c| c.is_ascii_alphanumeric() || c == '-');
        name.truncate(32);
        let name = format!("{name}-{}", self.short_id);
        let name = name.trim_matches('-').to_lowercase();
        name.replace("--", "-")
    }

    /// Records an extra pre-start archive (copy-to-container before start).
    pub fn add_pre_archive(&self, target: impl Into<String>, archive: Vec<u8>) {
        self.pre_archives.write().push(PreArchive {
            target: target.into(),
            archive,
        });
    }

    /// Pre-start archives recorded so far.
    #[must_use]
    pub fn pre_archives(&self) -> Vec<PreArchive> {
        self.pre_archives.read().clone()
    }

    /// Records the names of orchestrator resources created for this
    /// instance so teardown can find them even if label listing fails.
    pub fn record_resources(&self, services: &[String], config_maps: &[String]) {
        let mut res = self.resources.write();
        for svc in services {
            if !res.services.contains(svc) {
                res.services.push(svc.clone());
            }
        }
        for cm in config_maps {
            if !res.config_maps.contains(cm) {
                res.config_maps.push(cm.clone());
            }
        }
    }

    /// Snapshot of the assigned resource names.
    #[must_use]
    pub fn resources(&self) -> AssignedResources {
        self.resources.read().clone()
    }

    /// Publishes the port mapping. Only called once the workload is ready.
    pub fn publish_ports(&self, mapping: &BTreeMap<u16, u16>) {
        *self.port_mapping.write() = mapping.clone();
    }

    /// The published mapping (declared port to host port); empty until
    /// the workload reported ready.
    #[must_use]
    pub fn port_mapping(&self) -> BTreeMap<u16, u16> {
        self.port_mapping.read().clone()
    }

    /// Joins a network (bookkeeping only).
    pub fn connect_network(&self, network_id: &str) {
        self.networks.write().insert(network_id.to_string());
    }

    /// Leaves a network. Errors when the container is not a member.
    pub fn disconnect_network(&self, network_id: &str) -> Result<()> {
        if !self.networks.write().remove(network_id) {
            return Err(Error::NotFound {
                kind: "network",
                id: network_id.to_string(),
            });
        }
        Ok(())
    }

    /// Ids of the networks this container is a member of.
    #[must_use]
    pub fn networks(&self) -> BTreeSet<String> {
        self.networks.read().clone()
    }

    /// Records the failure a client will see on inspect.
    pub fn set_last_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    /// Last recorded failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Timestamp of the transition to Running.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read()
    }

    /// Timestamp of the transition to Stopped/Failed.
    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "nginx:alpine".into(),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(short_id(&id).len(), 12);
    }

    #[test]
    fn test_parse_tcp_port() {
        assert_eq!(parse_tcp_port("9000/tcp").unwrap(), 9000);
        assert_eq!(parse_tcp_port("80").unwrap(), 80);
        assert!(parse_tcp_port("53/udp").is_err());
        assert!(parse_tcp_port("nan/tcp").is_err());
    }

    #[test]
    fn test_parse_bind() {
        let m = Mount::parse_bind("/tmp:/data:ro").unwrap();
        assert_eq!(m.target, "/data");
        assert_eq!(m.mode, MountMode::ReadOnly);
        assert_eq!(m.kind, MountKind::Directory);

        let m = Mount::parse_bind("/no/such/file.txt:/etc/app.conf").unwrap();
        assert_eq!(m.mode, MountMode::ReadWrite);
        assert_eq!(m.kind, MountKind::File);

        assert!(Mount::parse_bind("justonepart").is_err());
        assert!(Mount::parse_bind(":/missing-src").is_err());
    }

    #[test]
    fn test_pod_name_is_dns_compatible() {
        let mut sp = spec();
        sp.image = "img".into();
        let tainr = Container::new("My_Weird Name!!", sp);
        let name = tainr.pod_name();
        assert!(name.starts_with("podbridge-my-weirdname"));
        assert!(name.ends_with(&tainr.short_id));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_state_transitions_and_watch() {
        let tainr = Container::new("web", spec());
        assert_eq!(tainr.state(), ContainerState::Created);
        assert!(tainr.started_at().is_none());

        let rx = tainr.watch_state();
        tainr.set_state(ContainerState::Running);
        assert_eq!(*rx.borrow(), ContainerState::Running);
        assert!(tainr.started_at().is_some());

        tainr.set_state(ContainerState::Stopped);
        assert!(tainr.finished_at().is_some());
        assert!(tainr.state().is_terminal());
    }

    #[test]
    fn test_network_membership() {
        let tainr = Container::new("web", spec());
        tainr.connect_network("netw1");
        assert!(tainr.networks().contains("netw1"));
        tainr.disconnect_network("netw1").unwrap();
        assert!(tainr.disconnect_network("netw1").is_err());
    }

    #[test]
    fn test_port_mapping_starts_empty() {
        let tainr = Container::new("web", spec());
        assert!(tainr.port_mapping().is_empty());
        let mut mapping = BTreeMap::new();
        mapping.insert(80u16, 32768u16);
        tainr.publish_ports(&mapping);
        assert_eq!(tainr.port_mapping().get(&80), Some(&32768));
    }
}
