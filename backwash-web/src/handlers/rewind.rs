//! Rewind dump and preload endpoints used between relays

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use backwash_core::rewind::PreloadSummary;
use serde::Serialize;
use tracing::{info, warn};

use super::rewind_error_status;
use crate::server::AppState;

/// Serves a snapshot of the stream's buffer in the dump format.
pub async fn dump_rewind(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let Some(buffer) = state.streams.get(&key).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let writer = match buffer.dump() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("Cannot dump {}: {}", key, e);
            return rewind_error_status(&e).into_response();
        }
    };

    info!("Serving rewind dump of {} ({} chunks)", key, writer.remaining());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(writer))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Outcome of a preload upload.
#[derive(Debug, Serialize)]
pub struct PreloadReport {
    pub stream: String,
    pub chunks_loaded: usize,
    pub chunks_skipped: usize,
    pub start_ts: Option<i64>,
    pub end_ts: Option<f64>,
    pub complete: bool,
    pub error: Option<String>,
}

impl PreloadReport {
    fn new(stream: String, summary: PreloadSummary) -> Self {
        let complete = summary.is_complete();
        Self {
            stream,
            chunks_loaded: summary.chunks_loaded,
            chunks_skipped: summary.chunks_skipped,
            start_ts: summary.header.as_ref().and_then(|h| h.start_ts),
            end_ts: summary.header.as_ref().and_then(|h| h.end_ts),
            complete,
            error: summary.error,
        }
    }
}

/// Replaces the stream's buffer with an uploaded dump.
///
/// Partial uploads keep whatever parsed; an upload without a valid header
/// is rejected.
pub async fn preload_rewind(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Body,
) -> (StatusCode, Json<PreloadReport>) {
    let buffer = state.streams.get_or_create(&key).await;
    let summary = buffer.preload(body.into_data_stream()).await;

    let status = if summary.header.is_none() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(PreloadReport::new(key, summary)))
}
