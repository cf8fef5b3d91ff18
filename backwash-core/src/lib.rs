//! Backwash Core - rewind buffering for live audio relays
//!
//! Keeps a bounded history of each stream's encoded audio so listeners can
//! join behind live, and moves that history between relays in a compact
//! binary dump format.

pub mod config;
pub mod rewind;
pub mod tracing_setup;

pub use config::{BackwashConfig, ListenerConfig, ReplicationConfig, RewindConfig};
pub use rewind::{
    Chunk, ChunkMeta, ChunkStore, ListenOptions, RewindBuffer, RewindError, Rewinder, Vitals,
    WireError,
};

/// Core errors that can bubble up from any Backwash subsystem.
#[derive(Debug, thiserror::Error)]
pub enum BackwashError {
    #[error("Rewind error: {0}")]
    Rewind(#[from] RewindError),

    #[error("Dump format error: {0}")]
    Wire(#[from] WireError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackwashError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            BackwashError::Rewind(e) => match e {
                RewindError::Destroyed { stream } => format!("Stream {stream} has shut down"),
                RewindError::NoVitals { stream } => {
                    format!("Stream {stream} has not reported its encoding yet")
                }
                RewindError::InvalidVitals { stream_key, .. } => {
                    format!("Stream {stream_key} reported an unusable encoding")
                }
                RewindError::OutOfOrder { .. } => "Audio arrived out of order".to_string(),
                RewindError::Loading { stream } => {
                    format!("Stream {stream} is loading its history, try again shortly")
                }
            },
            BackwashError::Wire(_) => "Rewind dump is damaged or incomplete".to_string(),
            BackwashError::Configuration { reason } => format!("Configuration error: {reason}"),
            BackwashError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to operator input.
    pub fn is_user_error(&self) -> bool {
        matches!(self, BackwashError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackwashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let err: BackwashError = RewindError::NoVitals {
            stream: "rock".to_string(),
        }
        .into();
        assert!(err.user_message().contains("rock"));
        assert!(!err.is_user_error());

        let err = BackwashError::Configuration {
            reason: "bad port".to_string(),
        };
        assert!(err.is_user_error());
        assert_eq!(err.user_message(), "Configuration error: bad port");
    }
}
