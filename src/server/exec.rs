//! Exec endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use bytes::BytesMut;
use serde_json::{json, Value};

use crate::backend::Backend;

use super::logs::{stream_frame, STREAM_STDERR, STREAM_STDOUT};
use super::types::ExecCreateRequest;
use super::{ApiError, ApiResult};

pub(super) async fn create(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Json(req): Json<ExecCreateRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let exec = backend.create_exec(&id, req.cmd, req.attach_stdout, req.attach_stderr)?;
    Ok((StatusCode::CREATED, Json(json!({ "Id": exec.id }))))
}

pub(super) async fn start(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let exec = backend.exec_session(&id)?;
    let output = backend.run_exec(&id).await?;

    let mut body = BytesMut::new();
    if exec.stdout && !output.stdout.is_empty() {
        body.extend_from_slice(&stream_frame(STREAM_STDOUT, &output.stdout));
    }
    if exec.stderr && !output.stderr.is_empty() {
        body.extend_from_slice(&stream_frame(STREAM_STDERR, &output.stderr));
    }

    Response::builder()
        .header(header::CONTENT_TYPE, "application/vnd.docker.raw-stream")
        .body(body.freeze().into())
        .map_err(|err| {
            ApiError::from(crate::error::Error::InvalidSpec {
                reason: err.to_string(),
            })
        })
}

pub(super) async fn inspect(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let exec = backend.exec_session(&id)?;
    Ok(Json(json!({
        "ID": exec.id,
        "ContainerID": exec.container_id,
        "Running": false,
        "ExitCode": exec.exit_code().unwrap_or(0),
    })))
}
