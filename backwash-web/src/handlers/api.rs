//! JSON status endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use backwash_core::rewind::{BufferStatus, ChunkMeta};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::server::AppState;

/// Buffer status plus the stream's now-playing metadata.
#[derive(Debug, Serialize)]
pub struct StreamStatus {
    #[serde(flatten)]
    pub status: BufferStatus,
    pub now_playing: Option<ChunkMeta>,
}

pub async fn list_streams(State(state): State<AppState>) -> Json<serde_json::Value> {
    let streams: Vec<StreamStatus> = state
        .streams
        .all()
        .await
        .iter()
        .map(|buffer| StreamStatus {
            status: buffer.status(),
            now_playing: buffer.current_meta(),
        })
        .collect();

    let uptime = Utc::now().signed_duration_since(state.started_at);
    Json(json!({
        "streams": streams,
        "total": streams.len(),
        "uptime_secs": uptime.num_seconds(),
    }))
}

pub async fn stream_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<StreamStatus>, StatusCode> {
    let buffer = state.streams.get(&key).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(StreamStatus {
        status: buffer.status(),
        now_playing: buffer.current_meta(),
    }))
}
