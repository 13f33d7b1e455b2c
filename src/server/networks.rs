//! Network endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::backend::Backend;
use crate::model::Network;

use super::types::{NetworkConnectRequest, NetworkCreateRequest};
use super::ApiResult;

fn network_body(netw: &Network) -> Value {
    json!({
        "Id": netw.id,
        "Name": netw.name,
        "Created": netw.created_at.to_rfc3339(),
        "Driver": "bridge",
        "Scope": "local",
        "Containers": netw
            .members()
            .iter()
            .map(|id| (id.clone(), json!({})))
            .collect::<serde_json::Map<_, _>>(),
    })
}

pub(super) async fn create(
    State(backend): State<Arc<Backend>>,
    Json(req): Json<NetworkCreateRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let netw = backend.create_network(&req.name)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "Id": netw.id, "Warning": "" })),
    ))
}

pub(super) async fn list(State(backend): State<Arc<Backend>>) -> Json<Value> {
    let entries: Vec<Value> = backend.networks().iter().map(|n| network_body(n.as_ref())).collect();
    Json(Value::Array(entries))
}

pub(super) async fn inspect(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let netw = backend.network(&id)?;
    Ok(Json(network_body(&netw)))
}

pub(super) async fn remove(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    backend.delete_network(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn connect(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Json(req): Json<NetworkConnectRequest>,
) -> ApiResult<StatusCode> {
    backend.connect_network(&id, &req.container).await?;
    Ok(StatusCode::OK)
}

pub(super) async fn disconnect(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Json(req): Json<NetworkConnectRequest>,
) -> ApiResult<StatusCode> {
    backend.disconnect_network(&id, &req.container).await?;
    Ok(StatusCode::OK)
}

pub(super) async fn prune(State(backend): State<Arc<Backend>>) -> Json<Value> {
    let deleted = backend.prune_networks();
    Json(json!({ "NetworksDeleted": deleted }))
}
