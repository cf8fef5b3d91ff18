//! Listener streaming endpoint

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use backwash_core::rewind::ListenOptions;
use serde::Deserialize;
use tracing::{info, warn};

use super::rewind_error_status;
use crate::server::AppState;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Query parameters for `GET /streams/{key}/listen`.
#[derive(Debug, Default, Deserialize)]
pub struct ListenQuery {
    /// Seconds behind live.
    pub offset: Option<f64>,
    /// Seconds of audio delivered on connect.
    pub burst: Option<f64>,
    /// Deliver the burst only, then end the response.
    pub pump: Option<bool>,
    /// Start at this epoch-millisecond instant instead of `offset`.
    pub ts: Option<i64>,
}

impl ListenQuery {
    fn into_options(self, default_burst: f64) -> ListenOptions {
        ListenOptions {
            offset_secs: self.offset.unwrap_or(0.0),
            initial_burst_secs: self.burst.unwrap_or(default_burst),
            pump_and_finish: self.pump.unwrap_or(false),
            timestamp: self.ts,
        }
    }
}

/// Streams audio to a listener, starting behind live as requested.
///
/// The response body stays open and follows live pushes until the client
/// disconnects, unless `pump=true` asks for a one-shot download.
pub async fn listen_stream(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<ListenQuery>,
) -> Response {
    let Some(buffer) = state.streams.get(&key).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let options = query.into_options(state.config.rewind.initial_burst_secs);
    let rewinder = match buffer.listen(options).await {
        Ok(rewinder) => rewinder,
        Err(e) => {
            warn!("Refusing listener on {}: {}", key, e);
            return rewind_error_status(&e).into_response();
        }
    };

    let content_type = buffer
        .vitals()
        .and_then(|vitals| vitals.content_type)
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
    info!(
        "Listener {} joined {} (offset {}s)",
        rewinder.id(),
        key,
        rewinder.options().offset_secs
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header("x-listener-id", rewinder.id().to_string())
        .body(Body::from_stream(rewinder))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
