//! In-memory data model: containers, networks, exec sessions, registry.

pub mod container;
pub mod exec;
pub mod network;
pub mod registry;

pub use container::{
    generate_id, parse_tcp_port, short_id, AssignedResources, Container, ContainerSpec,
    ContainerState, Mount, MountKind, MountMode, PreArchive, WaitPolicy, LABEL_PULL_POLICY,
    LABEL_REQUEST_CPU, LABEL_REQUEST_MEMORY, LABEL_RUNAS_USER, LABEL_SERVICE_ACCOUNT,
};
pub use exec::ExecSession;
pub use network::Network;
pub use registry::Registry;
