//! HTTP request handlers organized by functionality

pub mod api;
pub mod listen;
pub mod rewind;

use axum::http::StatusCode;
use backwash_core::rewind::RewindError;

pub use api::{StreamStatus, list_streams, stream_status};
pub use listen::{ListenQuery, listen_stream};
pub use rewind::{PreloadReport, dump_rewind, preload_rewind};

/// Maps buffer errors onto the status a client should see.
pub(crate) fn rewind_error_status(error: &RewindError) -> StatusCode {
    match error {
        RewindError::Destroyed { .. } => StatusCode::GONE,
        RewindError::NoVitals { .. } | RewindError::Loading { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RewindError::InvalidVitals { .. } | RewindError::OutOfOrder { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    }
}
