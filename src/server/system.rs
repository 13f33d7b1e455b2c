//! Engine-level endpoints and the acknowledged-only image surface.
//!
//! Image pulls happen on the cluster nodes when pods start, so the image
//! endpoints only acknowledge: a create reports success and an inspect
//! answers with a minimal record, which is what polling clients need
//! before they create a container.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::Backend;

pub(super) async fn ping() -> &'static str {
    "OK"
}

pub(super) async fn version() -> Json<Value> {
    Json(json!({
        "Version": env!("CARGO_PKG_VERSION"),
        "ApiVersion": "1.41",
        "MinAPIVersion": "1.24",
        "Os": std::env::consts::OS,
        "Arch": std::env::consts::ARCH,
    }))
}

pub(super) async fn info(State(backend): State<Arc<Backend>>) -> Json<Value> {
    Json(json!({
        "ID": "podbridge",
        "Name": "podbridge",
        "ServerVersion": env!("CARGO_PKG_VERSION"),
        "Containers": backend.containers().len(),
        "Images": 0,
        "OperatingSystem": "kubernetes",
        "MemTotal": 0,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct ImageCreateQuery {
    #[serde(rename = "fromImage")]
    from_image: Option<String>,
    tag: Option<String>,
}

pub(super) async fn image_create(Query(query): Query<ImageCreateQuery>) -> Json<Value> {
    let image = match (query.from_image, query.tag) {
        (Some(image), Some(tag)) => format!("{image}:{tag}"),
        (Some(image), None) => image,
        _ => String::new(),
    };
    Json(json!({ "status": format!("Pulling from {image}"), "progress": "done" }))
}

pub(super) async fn image_list() -> Json<Value> {
    Json(json!([]))
}

pub(super) async fn image_inspect(Path(name): Path<String>) -> Json<Value> {
    Json(json!({
        "Id": format!("sha256:{:064}", 0),
        "RepoTags": [name],
        "Config": { "Env": [], "Cmd": [], "Entrypoint": [] },
        "Architecture": std::env::consts::ARCH,
        "Os": "linux",
    }))
}
