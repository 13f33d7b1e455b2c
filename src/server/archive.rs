//! Archive (copy in/out) endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde::Deserialize;

use crate::backend::Backend;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub(super) struct ArchiveQuery {
    path: String,
}

pub(super) async fn put_archive(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Query(query): Query<ArchiveQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    backend.put_archive(&id, &query.path, body.to_vec()).await?;
    Ok(StatusCode::OK)
}

pub(super) async fn get_archive(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> ApiResult<Response> {
    let archive = backend.get_archive(&id, &query.path).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-tar")
        .body(archive.into())
        .map_err(|err| {
            ApiError::from(crate::error::Error::InvalidSpec {
                reason: err.to_string(),
            })
        })
}

pub(super) async fn head_archive(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> ApiResult<StatusCode> {
    if backend.path_exists(&id, &query.path).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}
