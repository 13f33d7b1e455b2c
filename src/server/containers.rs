//! Container endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::Backend;
use crate::model::{Container, ContainerState};

use super::ApiResult;

#[derive(Debug, Deserialize)]
pub(super) struct CreateQuery {
    name: Option<String>,
}

pub(super) async fn create(
    State(backend): State<Arc<Backend>>,
    Query(query): Query<CreateQuery>,
    Json(req): Json<super::types::ContainerCreateRequest>,
) -> ApiResult<(StatusCode, Json<super::types::ContainerCreateResponse>)> {
    let (spec, networks) = req.into_spec()?;
    let tainr = backend.create_container(query.name.unwrap_or_default(), spec, &networks)?;
    Ok((
        StatusCode::CREATED,
        Json(super::types::ContainerCreateResponse {
            id: tainr.id.clone(),
            warnings: Vec::new(),
        }),
    ))
}

pub(super) async fn list(State(backend): State<Arc<Backend>>) -> Json<Value> {
    let entries: Vec<Value> = backend
        .containers()
        .iter()
        .map(|tainr| list_entry(tainr))
        .collect();
    Json(Value::Array(entries))
}

pub(super) async fn inspect(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tainr = backend.container(&id)?;
    Ok(Json(inspect_body(&backend, &tainr)))
}

pub(super) async fn start(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    backend.start_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn stop(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    backend.stop_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn kill(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    // Workloads have no signal channel; a kill is an immediate stop.
    backend.stop_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn restart(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    backend.restart_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn wait(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let code = backend.wait_container(&id).await?;
    Ok(Json(json!({ "StatusCode": code })))
}

#[derive(Debug, Deserialize)]
pub(super) struct RenameQuery {
    name: String,
}

pub(super) async fn rename(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Query(query): Query<RenameQuery>,
) -> ApiResult<StatusCode> {
    backend.rename_container(&id, &query.name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn remove(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    backend.remove_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn status_label(state: ContainerState) -> &'static str {
    match state {
        ContainerState::Running => "running",
        ContainerState::Stopped => "exited",
        ContainerState::Failed => "dead",
        _ => "created",
    }
}

fn port_map(backend: &Backend, tainr: &Container) -> Value {
    let mut ports = serde_json::Map::new();
    for &port in &tainr.spec.exposed_ports {
        // The allocator refuses lookups until the workload runs, so a
        // created or stopped container renders no endpoints.
        let Ok(host_port) = backend.endpoint(&tainr.id, port) else {
            continue;
        };
        ports.insert(
            format!("{port}/tcp"),
            json!([{ "HostIp": "127.0.0.1", "HostPort": host_port.to_string() }]),
        );
    }
    Value::Object(ports)
}

fn networks_map(backend: &Backend, tainr: &Container) -> Value {
    let mut networks = serde_json::Map::new();
    for netw_id in tainr.networks() {
        if let Ok(netw) = backend.network(&netw_id) {
            networks.insert(
                netw.name.clone(),
                json!({
                    "NetworkID": netw.id,
                    "Aliases": tainr.spec.network_aliases.iter().collect::<Vec<_>>(),
                }),
            );
        }
    }
    Value::Object(networks)
}

fn list_entry(tainr: &Container) -> Value {
    let state = tainr.state();
    let ports: Vec<Value> = tainr
        .port_mapping()
        .iter()
        .map(|(port, host_port)| {
            json!({
                "PrivatePort": port,
                "PublicPort": host_port,
                "Type": "tcp",
                "IP": "127.0.0.1",
            })
        })
        .collect();
    json!({
        "Id": tainr.id,
        "Names": [format!("/{}", tainr.name())],
        "Image": tainr.spec.image,
        "State": status_label(state),
        "Status": state.state_string(),
        "Labels": tainr.spec.labels,
        "Ports": ports,
        "Created": tainr.created_at.timestamp(),
    })
}

fn inspect_body(backend: &Backend, tainr: &Arc<Container>) -> Value {
    let state = tainr.state();
    let env: Vec<String> = tainr
        .spec
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    json!({
        "Id": tainr.id,
        "Name": format!("/{}", tainr.name()),
        "Image": tainr.spec.image,
        "Created": tainr.created_at.to_rfc3339(),
        "State": {
            "Status": status_label(state),
            "Running": state == ContainerState::Running,
            "Paused": false,
            "Restarting": false,
            "OOMKilled": false,
            "Dead": state == ContainerState::Failed,
            "ExitCode": i32::from(state == ContainerState::Failed),
            "Error": tainr.last_error().unwrap_or_default(),
            "StartedAt": tainr.started_at().map(|t| t.to_rfc3339()),
            "FinishedAt": tainr.finished_at().map(|t| t.to_rfc3339()),
        },
        "Config": {
            "Image": tainr.spec.image,
            "Cmd": tainr.spec.cmd,
            "Entrypoint": tainr.spec.entrypoint,
            "Env": env,
            "Labels": tainr.spec.labels,
        },
        "HostConfig": {
            "NetworkMode": "bridge",
        },
        "NetworkSettings": {
            "IPAddress": "127.0.0.1",
            "Ports": port_map(backend, tainr),
            "Networks": networks_map(backend, tainr),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kube::mock::MockOrchestrator;
    use crate::kube::Orchestrator;
    use crate::model::ContainerSpec;
    use tokio::sync::watch;

    fn backend() -> (Arc<Backend>, watch::Sender<bool>) {
        let orch = Arc::new(MockOrchestrator::new());
        let (tx, rx) = watch::channel(false);
        let backend = Backend::new(&Config::default(), orch as Arc<dyn Orchestrator>, rx);
        (Arc::new(backend), tx)
    }

    #[tokio::test]
    async fn test_inspect_body_shape() {
        let (backend, _tx) = backend();
        let tainr = backend
            .create_container(
                "web",
                ContainerSpec {
                    image: "nginx:alpine".into(),
                    exposed_ports: vec![80],
                    ..Default::default()
                },
                &[],
            )
            .unwrap();
        backend.start_container(&tainr.id).await.unwrap();

        let body = inspect_body(&backend, &tainr);

        assert_eq!(body["State"]["Status"], "running");
        assert_eq!(body["State"]["Running"], true);
        assert_eq!(body["Name"], "/web");
        assert!(body["NetworkSettings"]["Ports"]["80/tcp"][0]["HostPort"].is_string());
        assert!(body["NetworkSettings"]["Networks"]["bridge"].is_object());
    }

    #[tokio::test]
    async fn test_inspect_hides_ports_until_running() {
        let (backend, _tx) = backend();
        let tainr = backend
            .create_container(
                "web",
                ContainerSpec {
                    image: "nginx:alpine".into(),
                    exposed_ports: vec![80],
                    ..Default::default()
                },
                &[],
            )
            .unwrap();

        let body = inspect_body(&backend, &tainr);
        assert!(body["NetworkSettings"]["Ports"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_entry_shape() {
        let (backend, _tx) = backend();
        let tainr = backend
            .create_container(
                "db",
                ContainerSpec {
                    image: "postgres:16".into(),
                    ..Default::default()
                },
                &[],
            )
            .unwrap();

        let entry = list_entry(&tainr);

        assert_eq!(entry["Names"][0], "/db");
        assert_eq!(entry["State"], "created");
        assert_eq!(entry["Image"], "postgres:16");
    }
}
