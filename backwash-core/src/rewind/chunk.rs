//! Chunk and encoding descriptors shared by the store, the wire codec and
//! listener streams.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One packet of encoded audio as produced by the upstream chunker.
///
/// `ts` is epoch milliseconds and is non-decreasing across the chunks of one
/// stream. The payload is opaque to the rewind subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Epoch milliseconds at which this chunk starts.
    pub ts: i64,
    /// Playback length in milliseconds.
    pub duration: f64,
    /// Encoded audio frame(s).
    pub data: Bytes,
    /// Now-playing metadata attached by the source, if any.
    pub meta: Option<ChunkMeta>,
}

impl Chunk {
    /// Creates a chunk without metadata.
    pub fn new(ts: i64, duration: f64, data: impl Into<Bytes>) -> Self {
        Self {
            ts,
            duration,
            data: data.into(),
            meta: None,
        }
    }

    /// Attaches now-playing metadata.
    pub fn with_meta(mut self, meta: ChunkMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Timestamp at which this chunk stops playing.
    pub fn end_ts(&self) -> f64 {
        self.ts as f64 + self.duration
    }

    /// Returns true if `ts` falls inside `[self.ts, self.ts + duration)`.
    pub fn contains(&self, ts: i64) -> bool {
        let ts = ts as f64;
        ts >= self.ts as f64 && ts < self.end_ts()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Small now-playing metadata carried alongside audio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ChunkMeta {
    /// Metadata with only a title.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            url: None,
        }
    }
}

/// Encoding parameters of the audio a buffer currently holds.
///
/// Two vitals with different `stream_key` values describe incompatible audio:
/// chunks from both must never share one buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vitals {
    /// Opaque fingerprint of codec, bitrate and sample rate.
    pub stream_key: String,
    /// Seconds of audio per chunk; drives all offset and seconds conversion.
    pub chunk_duration: f64,
    /// Informational frame rate of the encoding.
    #[serde(default)]
    pub frames_per_second: f64,
    /// Content type listeners should be served, e.g. `audio/mpeg`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Vitals {
    /// Creates vitals with an informational frame rate of zero.
    pub fn new(stream_key: impl Into<String>, chunk_duration: f64) -> Self {
        Self {
            stream_key: stream_key.into(),
            chunk_duration,
            frames_per_second: 0.0,
            content_type: None,
        }
    }

    /// Returns true if chunk duration can drive offset math.
    pub fn is_usable(&self) -> bool {
        self.chunk_duration.is_finite() && self.chunk_duration > 0.0
    }

    /// Converts seconds behind live into a chunk offset.
    ///
    /// Negative input clamps to zero. Rounds to the nearest chunk.
    pub fn seconds_to_offset(&self, seconds: f64) -> usize {
        if !self.is_usable() || !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (seconds / self.chunk_duration).round() as usize
    }

    /// Converts a chunk offset into seconds behind live.
    pub fn offset_to_seconds(&self, offset: usize) -> f64 {
        offset as f64 * self.chunk_duration
    }
}
