//! Incremental dump parser

use bytes::{Buf, BytesMut};

use super::{MAX_HEADER_LEN, RewindHeader, WireChunk, WireError};
use crate::rewind::chunk::Chunk;

/// One decoded unit of a dump.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderFrame {
    Header(RewindHeader),
    Chunk(Chunk),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoaderState {
    AwaitingHeader,
    AwaitingChunk,
    Failed,
}

/// Streaming parser for the dump format.
///
/// Bytes are fed in whatever pieces the transport delivers; a frame is only
/// produced once its declared length is fully buffered, so a transfer cut
/// mid-frame never yields a partial chunk.
#[derive(Debug)]
pub struct RewindLoader {
    buffer: BytesMut,
    state: LoaderState,
    chunks_decoded: usize,
}

impl Default for RewindLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl RewindLoader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: LoaderState::AwaitingHeader,
            chunks_decoded: 0,
        }
    }

    /// Appends transport bytes to the parse buffer.
    pub fn feed(&mut self, data: &[u8]) {
        if self.state != LoaderState::Failed {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Decodes the next complete frame, if one is buffered.
    ///
    /// The header is always the first frame returned. After an error the
    /// loader is spent and only returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - `WireError::HeaderTooLarge` - Declared header length is implausible
    /// - `WireError::InvalidHeader` - Header JSON does not parse
    /// - `WireError::InvalidChunkMeta` - Chunk metadata JSON does not parse
    pub fn next_frame(&mut self) -> Result<Option<LoaderFrame>, WireError> {
        let result = match self.state {
            LoaderState::AwaitingHeader => self.try_parse_header(),
            LoaderState::AwaitingChunk => self.try_parse_chunk(),
            LoaderState::Failed => return Ok(None),
        };
        if result.is_err() {
            self.state = LoaderState::Failed;
            self.buffer.clear();
        }
        result
    }

    /// Checks the input ended on a frame boundary after a header.
    ///
    /// # Errors
    ///
    /// - `WireError::MissingHeader` - No header frame was decoded
    /// - `WireError::Truncated` - Bytes of an incomplete frame remain
    pub fn finish(&self) -> Result<(), WireError> {
        if !self.buffer.is_empty() {
            return Err(WireError::Truncated {
                buffered: self.buffer.len(),
            });
        }
        if self.state == LoaderState::AwaitingHeader {
            return Err(WireError::MissingHeader);
        }
        Ok(())
    }

    pub fn chunks_decoded(&self) -> usize {
        self.chunks_decoded
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn try_parse_header(&mut self) -> Result<Option<LoaderFrame>, WireError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        if len > MAX_HEADER_LEN {
            return Err(WireError::HeaderTooLarge { len });
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }

        self.buffer.advance(4);
        let json = self.buffer.split_to(len);
        let header: RewindHeader =
            serde_json::from_slice(&json).map_err(WireError::InvalidHeader)?;

        self.state = LoaderState::AwaitingChunk;
        Ok(Some(LoaderFrame::Header(header)))
    }

    fn try_parse_chunk(&mut self) -> Result<Option<LoaderFrame>, WireError> {
        let Some(&meta_len) = self.buffer.first() else {
            return Ok(None);
        };
        let meta_len = meta_len as usize;
        if self.buffer.len() < 3 + meta_len {
            return Ok(None);
        }

        let data_len =
            u16::from_le_bytes([self.buffer[1 + meta_len], self.buffer[2 + meta_len]]) as usize;
        if self.buffer.len() < 3 + meta_len + data_len {
            return Ok(None);
        }

        let meta: WireChunk = serde_json::from_slice(&self.buffer[1..1 + meta_len])
            .map_err(WireError::InvalidChunkMeta)?;
        self.buffer.advance(3 + meta_len);
        let data = self.buffer.split_to(data_len).freeze();

        self.chunks_decoded += 1;
        Ok(Some(LoaderFrame::Chunk(Chunk {
            ts: meta.ts,
            duration: meta.duration,
            data,
            meta: meta.meta,
        })))
    }
}

/// Decodes a complete in-memory dump.
///
/// # Errors
///
/// Any `WireError` from parsing, or from [`RewindLoader::finish`] if the
/// bytes end mid-frame.
pub fn decode_all(data: &[u8]) -> Result<Vec<LoaderFrame>, WireError> {
    let mut loader = RewindLoader::new();
    loader.feed(data);

    let mut frames = Vec::new();
    while let Some(frame) = loader.next_frame()? {
        frames.push(frame);
    }
    loader.finish()?;
    Ok(frames)
}
