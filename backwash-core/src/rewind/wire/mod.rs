//! Binary dump format for rewind buffers
//!
//! A dump is one header frame followed by chunk frames, newest chunk first.
//! All integers are little-endian.
//!
//! ```text
//! header: u32 len | len bytes of JSON {startTs, endTs, vitals}
//! chunk:  u8 m | m bytes of JSON {ts, duration, meta} | u16 d | d bytes payload
//! ```
//!
//! There is no terminator; the dump ends where the transport ends.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub use self::loader::{LoaderFrame, RewindLoader, decode_all};
pub use self::writer::RewindWriter;
use super::chunk::{Chunk, ChunkMeta, Vitals};

mod loader;
mod writer;

/// Largest chunk metadata JSON a frame can carry.
pub const MAX_META_LEN: usize = u8::MAX as usize;

/// Largest chunk payload a frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Header frames beyond this size are treated as corrupt input.
pub const MAX_HEADER_LEN: usize = 1024 * 1024;

/// Failures encoding or decoding the dump format.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("chunk metadata is {len} bytes, frame limit is {MAX_META_LEN}")]
    MetadataTooLarge { len: usize },

    #[error("chunk payload is {len} bytes, frame limit is {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge { len: usize },

    #[error("header frame declares {len} bytes, limit is {MAX_HEADER_LEN}")]
    HeaderTooLarge { len: usize },

    #[error("invalid header JSON: {0}")]
    InvalidHeader(#[source] serde_json::Error),

    #[error("invalid chunk metadata JSON: {0}")]
    InvalidChunkMeta(#[source] serde_json::Error),

    #[error("stream ended before a header frame was received")]
    MissingHeader,

    #[error("stream ended inside a frame ({buffered} bytes left undecoded)")]
    Truncated { buffered: usize },
}

/// First frame of every dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindHeader {
    /// Timestamp of the oldest chunk in the dump.
    pub start_ts: Option<i64>,
    /// End of the newest chunk (`ts + duration`).
    pub end_ts: Option<f64>,
    pub vitals: Vitals,
}

impl RewindHeader {
    /// Builds the header describing an oldest-first chunk sequence.
    pub fn describe(vitals: Vitals, chunks: &[Chunk]) -> Self {
        Self {
            start_ts: chunks.first().map(|c| c.ts),
            end_ts: chunks.last().map(Chunk::end_ts),
            vitals,
        }
    }
}

/// Metadata projection of a chunk; everything but the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChunk {
    pub ts: i64,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ChunkMeta>,
}

impl From<&Chunk> for WireChunk {
    fn from(chunk: &Chunk) -> Self {
        Self {
            ts: chunk.ts,
            duration: chunk.duration,
            meta: chunk.meta.clone(),
        }
    }
}

/// Appends a header frame to `out`.
///
/// # Errors
///
/// - `WireError::HeaderTooLarge` - Serialized header exceeds `MAX_HEADER_LEN`
pub fn encode_header(header: &RewindHeader, out: &mut BytesMut) -> Result<(), WireError> {
    let json = serde_json::to_vec(header).map_err(WireError::InvalidHeader)?;
    if json.len() > MAX_HEADER_LEN {
        return Err(WireError::HeaderTooLarge { len: json.len() });
    }
    out.reserve(4 + json.len());
    out.put_u32_le(json.len() as u32);
    out.put_slice(&json);
    Ok(())
}

/// Appends one chunk frame to `out`. Limits are checked before anything is
/// written, so a failed call leaves `out` untouched.
///
/// # Errors
///
/// - `WireError::MetadataTooLarge` - Metadata JSON exceeds 255 bytes
/// - `WireError::PayloadTooLarge` - Payload exceeds 65535 bytes
pub fn encode_chunk(chunk: &Chunk, out: &mut BytesMut) -> Result<(), WireError> {
    let meta = serde_json::to_vec(&WireChunk::from(chunk)).map_err(WireError::InvalidChunkMeta)?;
    if meta.len() > MAX_META_LEN {
        return Err(WireError::MetadataTooLarge { len: meta.len() });
    }
    if chunk.data.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge {
            len: chunk.data.len(),
        });
    }

    out.reserve(3 + meta.len() + chunk.data.len());
    out.put_u8(meta.len() as u8);
    out.put_slice(&meta);
    out.put_u16_le(chunk.data.len() as u16);
    out.put_slice(&chunk.data);
    Ok(())
}
