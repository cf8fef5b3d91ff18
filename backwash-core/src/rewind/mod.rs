//! Rewind buffering for live audio streams
//!
//! Each stream keeps a bounded, time-ordered history of encoded chunks in a
//! [`RewindBuffer`]. Listeners attach through a [`Rewinder`], which seeds
//! itself from that history and then follows live pushes at a fixed delay.
//! Buffers can be dumped to, and preloaded from, a compact binary format for
//! replica warm starts.

pub mod buffer;
pub mod chunk;
pub mod rewinder;
pub mod stats;
pub mod store;
pub mod wire;

pub use self::buffer::{PreloadSummary, RewindBuffer, VitalsChange};
pub use self::chunk::{Chunk, ChunkMeta, Vitals};
pub use self::rewinder::{ListenOptions, ReadOutcome, Rewinder, RewinderState};
pub use self::stats::{BufferStatus, ListenStats, ListenerReport};
pub use self::store::{ChunkStore, InsertOutcome, StoreCounters, StoreQuery};
pub use self::wire::{LoaderFrame, RewindHeader, RewindLoader, RewindWriter, WireError};

/// Errors raised by rewind buffer operations
#[derive(Debug, thiserror::Error)]
pub enum RewindError {
    /// Buffer was destroyed and accepts no further work
    #[error("rewind buffer for {stream} has been destroyed")]
    Destroyed { stream: String },

    /// Vitals cannot drive offset math
    #[error("invalid vitals for {stream_key}: chunk duration {chunk_duration}")]
    InvalidVitals {
        stream_key: String,
        chunk_duration: f64,
    },

    /// Operation needs encoding vitals that have not been reported yet
    #[error("rewind buffer for {stream} has no vitals yet")]
    NoVitals { stream: String },

    /// A preload is replacing the buffered audio
    #[error("rewind buffer for {stream} is loading")]
    Loading { stream: String },

    /// Chunk timestamp lands inside the buffered span without matching a chunk
    #[error("chunk at ts {ts} is out of order for the buffered span")]
    OutOfOrder { ts: i64 },
}
