//! Wire types of the container API.
//!
//! Field names follow the Docker Engine JSON conventions; everything a
//! client may omit defaults. Requests are translated into a
//! [`ContainerSpec`](crate::model::ContainerSpec) at the edge so nothing
//! below the server layer ever sees wire shapes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::model::{parse_tcp_port, ContainerSpec, Mount};

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerCreateRequest {
    /// Image reference; the only required field.
    #[serde(rename = "Image")]
    pub image: String,
    /// Entrypoint override.
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    /// Command override.
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    /// `KEY=VALUE` pairs.
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    /// Keys like `80/tcp`; values carry no information.
    #[serde(rename = "ExposedPorts")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    /// Free-form labels copied onto the workload.
    #[serde(rename = "Labels")]
    pub labels: BTreeMap<String, String>,
    /// Host-side settings (binds, port publications).
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfig,
    /// Networks and aliases to join on creation.
    #[serde(rename = "NetworkingConfig")]
    pub networking_config: NetworkingConfig,
}

/// Subset of `HostConfig` the engine honors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Bind mounts as `/src:/dst[:ro]`.
    #[serde(rename = "Binds")]
    pub binds: Vec<String>,
    /// Requested port publications; keys like `80/tcp`.
    #[serde(rename = "PortBindings")]
    pub port_bindings: BTreeMap<String, serde_json::Value>,
}

/// Requested network endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkingConfig {
    /// Network name or id to endpoint settings.
    #[serde(rename = "EndpointsConfig")]
    pub endpoints_config: BTreeMap<String, EndpointConfig>,
}

/// Per-endpoint settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// DNS aliases inside the network.
    #[serde(rename = "Aliases")]
    pub aliases: Vec<String>,
}

impl ContainerCreateRequest {
    /// Translates the request into a spec plus the networks to join.
    pub fn into_spec(self) -> Result<(ContainerSpec, Vec<String>)> {
        if self.image.is_empty() {
            return Err(Error::InvalidSpec {
                reason: "no image specified".to_string(),
            });
        }

        let mut env = BTreeMap::new();
        for pair in &self.env {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::InvalidSpec {
                    reason: format!("could not parse env entry `{pair}`"),
                });
            };
            env.insert(key.to_string(), value.to_string());
        }

        // Declared and published ports both count as exposed.
        let mut seen = BTreeSet::new();
        let mut exposed_ports = Vec::new();
        for key in self.exposed_ports.keys().chain(self.host_config.port_bindings.keys()) {
            let port = parse_tcp_port(key)?;
            if seen.insert(port) {
                exposed_ports.push(port);
            }
        }

        let mounts = self
            .host_config
            .binds
            .iter()
            .map(|bind| Mount::parse_bind(bind))
            .collect::<Result<Vec<_>>>()?;

        let mut network_aliases = BTreeSet::new();
        let mut networks = Vec::new();
        for (name, endpoint) in self.networking_config.endpoints_config {
            networks.push(name);
            network_aliases.extend(endpoint.aliases);
        }

        let spec = ContainerSpec {
            image: self.image,
            entrypoint: self.entrypoint.unwrap_or_default(),
            cmd: self.cmd.unwrap_or_default(),
            env,
            exposed_ports,
            mounts,
            network_aliases,
            labels: self.labels,
            wait: Default::default(),
        };
        Ok((spec, networks))
    }
}

/// Body of `POST /containers/create` responses.
#[derive(Debug, Serialize)]
pub struct ContainerCreateResponse {
    /// Full container id.
    #[serde(rename = "Id")]
    pub id: String,
    /// Non-fatal notices.
    #[serde(rename = "Warnings")]
    pub warnings: Vec<String>,
}

/// Body of `POST /containers/{id}/exec`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecCreateRequest {
    /// Command and arguments.
    #[serde(rename = "Cmd")]
    pub cmd: Vec<String>,
    /// Include stdout in the reply stream.
    #[serde(rename = "AttachStdout")]
    pub attach_stdout: bool,
    /// Include stderr in the reply stream.
    #[serde(rename = "AttachStderr")]
    pub attach_stderr: bool,
}

/// Body of `POST /networks/create`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkCreateRequest {
    /// Network name, unique among live networks.
    #[serde(rename = "Name")]
    pub name: String,
}

/// Body of `POST /networks/{id}/connect` and `/disconnect`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConnectRequest {
    /// Container id, short id prefix, or name.
    #[serde(rename = "Container")]
    pub container: String,
}

/// Error body every non-2xx response carries.
#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    /// Human-readable cause, carrying the container id and phase.
    pub message: String,
}
