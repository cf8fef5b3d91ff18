//! Pull-based dump producer

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tracing::{debug, warn};

use super::{RewindHeader, WireError, encode_chunk, encode_header};
use crate::rewind::chunk::{Chunk, Vitals};

/// Default number of bytes produced per poll when used as a stream.
const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Serializes a frozen chunk snapshot, newest chunk first.
///
/// Frames are produced on demand: each [`read`](Self::read) emits whole frames
/// until the requested size is reached, so a slow consumer only ever holds one
/// read's worth of encoded bytes.
pub struct RewindWriter {
    header: RewindHeader,
    header_sent: bool,
    chunks: Vec<Chunk>,
    read_size: usize,
    failed: bool,
}

impl RewindWriter {
    /// Creates a writer over an oldest-first snapshot.
    pub fn new(vitals: Vitals, chunks: Vec<Chunk>) -> Self {
        let header = RewindHeader::describe(vitals, &chunks);
        Self {
            header,
            header_sent: false,
            chunks,
            read_size: DEFAULT_READ_SIZE,
            failed: false,
        }
    }

    /// Sets how many bytes each stream poll aims to produce.
    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    pub fn header(&self) -> &RewindHeader {
        &self.header
    }

    /// Chunk frames not yet produced.
    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }

    /// Produces whole frames until at least `size` bytes are ready.
    ///
    /// Returns `Ok(None)` once the oldest chunk has been emitted.
    ///
    /// # Errors
    ///
    /// - `WireError::MetadataTooLarge` / `WireError::PayloadTooLarge` - A chunk
    ///   cannot be framed; the dump stops here
    pub fn read(&mut self, size: usize) -> Result<Option<Bytes>, WireError> {
        if self.failed {
            return Ok(None);
        }

        let mut out = BytesMut::new();
        if !self.header_sent {
            encode_header(&self.header, &mut out).inspect_err(|_| self.failed = true)?;
            self.header_sent = true;
        }

        while out.len() < size.max(1) {
            let Some(chunk) = self.chunks.pop() else {
                break;
            };
            if let Err(e) = encode_chunk(&chunk, &mut out) {
                warn!("Aborting dump at chunk ts {}: {}", chunk.ts, e);
                self.failed = true;
                return Err(e);
            }
        }

        if out.is_empty() {
            debug!("Rewind dump complete");
            return Ok(None);
        }
        Ok(Some(out.freeze()))
    }
}

impl Stream for RewindWriter {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let size = this.read_size;
        Poll::Ready(this.read(size).map_err(io::Error::other).transpose())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            (0, None)
        }
    }
}
