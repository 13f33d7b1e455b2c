//! Log endpoint and stream framing.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::Response;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use serde::Deserialize;

use crate::backend::Backend;

use super::{ApiError, ApiResult};

/// Stdout channel marker of the multiplexed stream format.
pub(super) const STREAM_STDOUT: u8 = 1;
/// Stderr channel marker.
pub(super) const STREAM_STDERR: u8 = 2;

/// Wraps a payload in the 8-byte multiplexed stream header: channel
/// marker, three zero bytes, payload length big-endian.
pub(super) fn stream_frame(channel: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u8(channel);
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    #[serde(default)]
    follow: bool,
    tail: Option<String>,
}

pub(super) async fn container_logs(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let tail_lines = match query.tail.as_deref() {
        None | Some("all") | Some("") => None,
        Some(n) => n.parse::<i64>().ok(),
    };

    let lines = backend
        .container_logs(&id, query.follow, tail_lines)
        .await?;
    let frames = lines.map(|line| {
        line.map(|line| {
            let mut payload = line.into_bytes();
            payload.push(b'\n');
            stream_frame(STREAM_STDOUT, &payload)
        })
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/vnd.docker.raw-stream")
        .body(Body::from_stream(frames))
        .map_err(|err| {
            ApiError::from(crate::error::Error::InvalidSpec {
                reason: err.to_string(),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_frame_header() {
        let frame = stream_frame(STREAM_STDOUT, b"hello");
        assert_eq!(&frame[..4], &[1, 0, 0, 0]);
        assert_eq!(&frame[4..8], &5u32.to_be_bytes());
        assert_eq!(&frame[8..], b"hello");
    }

    #[test]
    fn test_stream_frame_empty_payload() {
        let frame = stream_frame(STREAM_STDERR, b"");
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[0], 2);
    }
}
