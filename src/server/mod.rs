//! HTTP facade speaking the Docker Engine API.
//!
//! Thin by construction: handlers parse the wire shape, call the backend
//! and render the response. Clients prefix paths with an API version
//! (`/v1.41/containers/json`); a middleware strips the prefix so routes
//! are declared once.

mod archive;
mod containers;
mod exec;
mod logs;
mod networks;
mod system;
mod types;

use std::sync::Arc;
use std::sync::OnceLock;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use regex::Regex;
use tracing::debug;

use crate::backend::Backend;
use crate::error::Error;

use types::ErrorMessage;

/// API-level error wrapper rendering the engine error body.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidSpec { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } | Error::NotReady { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyStarting { .. }
            | Error::AliasConflict { .. }
            | Error::NotRunning { .. } => StatusCode::CONFLICT,
            Error::StartTimeout { .. }
            | Error::MountTooLarge { .. }
            | Error::Cancelled { .. }
            | Error::Orchestrator { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        debug!(status = %status, error = %self.0, "request failed");
        (
            status,
            Json(ErrorMessage {
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

fn version_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/v[0-9]+\.[0-9]+(/.*)?$").unwrap())
}

async fn strip_version_prefix(mut req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if let Some(caps) = version_prefix().captures(&path) {
        let rest = caps.get(1).map_or("/", |m| m.as_str());
        let new_path_and_query = match req.uri().query() {
            Some(q) => format!("{rest}?{q}"),
            None => rest.to_string(),
        };
        if let Ok(uri) = new_path_and_query.parse::<Uri>() {
            *req.uri_mut() = uri;
        }
    }
    next.run(req).await
}

/// Builds the engine router over a backend.
pub fn router(backend: Arc<Backend>) -> Router {
    Router::new()
        .route("/_ping", get(system::ping).head(system::ping))
        .route("/version", get(system::version))
        .route("/info", get(system::info))
        .route("/images/create", post(system::image_create))
        .route("/images/json", get(system::image_list))
        .route("/images/:name/json", get(system::image_inspect))
        .route("/containers/create", post(containers::create))
        .route("/containers/json", get(containers::list))
        .route("/containers/:id/json", get(containers::inspect))
        .route("/containers/:id/start", post(containers::start))
        .route("/containers/:id/stop", post(containers::stop))
        .route("/containers/:id/kill", post(containers::kill))
        .route("/containers/:id/restart", post(containers::restart))
        .route("/containers/:id/wait", post(containers::wait))
        .route("/containers/:id/rename", post(containers::rename))
        .route("/containers/:id", delete(containers::remove))
        .route("/containers/:id/logs", get(logs::container_logs))
        .route(
            "/containers/:id/archive",
            put(archive::put_archive)
                .get(archive::get_archive)
                .head(archive::head_archive),
        )
        .route("/containers/:id/exec", post(exec::create))
        .route("/exec/:id/start", post(exec::start))
        .route("/exec/:id/json", get(exec::inspect))
        .route("/networks/create", post(networks::create))
        .route("/networks", get(networks::list))
        .route("/networks/prune", post(networks::prune))
        .route("/networks/:id", get(networks::inspect).delete(networks::remove))
        .route("/networks/:id/connect", post(networks::connect))
        .route("/networks/:id/disconnect", post(networks::disconnect))
        .layer(middleware::from_fn(strip_version_prefix))
        .with_state(backend)
}
