//! Backwash Web - HTTP surface for rewind buffers
//!
//! Serves listener streams at any offset behind live, rewind dumps for
//! replicas, and preload uploads. Also hosts the replica warm start and the
//! synthetic demo source.

#![warn(clippy::missing_errors_doc)]

pub mod demo;
pub mod handlers;
pub mod replica;
pub mod server;

pub use server::{AppState, ServerOptions, StreamRegistry, build_router, run_server};

/// Errors raised while running the HTTP server or talking to a master relay.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("Request to master {url} failed: {source}")]
    Master { url: String, source: reqwest::Error },

    #[error("Master {url} answered with status {status}")]
    MasterStatus { url: String, status: u16 },
}
