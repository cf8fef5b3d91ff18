//! Ordered, size-bounded chunk storage
//!
//! Chunks are kept oldest-first. Offsets count chunks back from the newest
//! entry: offset 0 is the most recently stored chunk.

use std::collections::VecDeque;
use std::ops::Range;

use serde::Serialize;
use tracing::{debug, warn};

use super::chunk::Chunk;

/// Position lookup for [`ChunkStore::at`] and [`ChunkStore::range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreQuery {
    /// Chunks behind the newest entry.
    Offset(usize),
    /// Epoch milliseconds resolved to the best matching chunk.
    Timestamp(i64),
}

impl From<usize> for StoreQuery {
    fn from(offset: usize) -> Self {
        StoreQuery::Offset(offset)
    }
}

/// Result of a single [`ChunkStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored at the newest end (live path).
    Appended,
    /// Stored at the oldest end (historical load path).
    Prepended,
    /// A chunk with the same timestamp is already stored.
    Duplicate,
    /// Timestamp falls strictly inside the stored span without matching an
    /// existing chunk. Nothing was stored.
    OutOfOrder,
}

impl InsertOutcome {
    /// Returns true if the chunk is now held by the store.
    pub fn is_stored(self) -> bool {
        matches!(self, InsertOutcome::Appended | InsertOutcome::Prepended)
    }
}

/// Counters describing store activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounters {
    pub inserted: u64,
    pub evicted: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
}

/// Time-ordered chunk sequence with a maximum length.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    chunks: VecDeque<Chunk>,
    max_length: usize,
    counters: StoreCounters,
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl ChunkStore {
    /// Creates an empty store holding at most `max_length` chunks.
    pub fn new(max_length: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            max_length,
            counters: StoreCounters::default(),
        }
    }

    /// Stores a chunk at whichever end its timestamp belongs to.
    ///
    /// Duplicate timestamps are ignored. A timestamp strictly between the
    /// oldest and newest entries that matches no stored chunk cannot be placed
    /// without breaking order and is rejected with a warning.
    pub fn insert(&mut self, chunk: Chunk) -> InsertOutcome {
        let outcome = match (self.chunks.front(), self.chunks.back()) {
            (Some(first), Some(last)) => {
                if chunk.ts > last.ts {
                    InsertOutcome::Appended
                } else if chunk.ts < first.ts {
                    InsertOutcome::Prepended
                } else if chunk.ts == first.ts || chunk.ts == last.ts {
                    InsertOutcome::Duplicate
                } else if self.position_of_ts(chunk.ts).is_some() {
                    InsertOutcome::Duplicate
                } else {
                    InsertOutcome::OutOfOrder
                }
            }
            _ => InsertOutcome::Appended,
        };

        match outcome {
            InsertOutcome::Appended => self.chunks.push_back(chunk),
            InsertOutcome::Prepended => self.chunks.push_front(chunk),
            InsertOutcome::Duplicate => {
                self.counters.duplicates += 1;
                debug!("Ignoring duplicate chunk at ts {}", chunk.ts);
            }
            InsertOutcome::OutOfOrder => {
                self.counters.out_of_order += 1;
                warn!(
                    "Rejected out-of-order chunk at ts {} (buffer spans {:?}..{:?})",
                    chunk.ts,
                    self.first().map(|c| c.ts),
                    self.last().map(|c| c.ts)
                );
            }
        }

        if outcome.is_stored() {
            self.counters.inserted += 1;
            self.enforce_max_length();
        }
        outcome
    }

    /// Sets the length bound, evicting immediately if now over capacity.
    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
        self.enforce_max_length();
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Oldest stored chunk.
    pub fn first(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    /// Newest stored chunk.
    pub fn last(&self) -> Option<&Chunk> {
        self.chunks.back()
    }

    pub fn counters(&self) -> StoreCounters {
        self.counters
    }

    /// Chunk at an offset (clamped to the stored span) or best matching a
    /// timestamp. `None` only when the store is empty.
    pub fn at(&self, query: impl Into<StoreQuery>) -> Option<&Chunk> {
        let index = self.resolve(query.into())?;
        self.chunks.get(index)
    }

    /// Up to `length` chunks starting at the resolved position and moving
    /// toward the newest entry, returned oldest-first.
    pub fn range(&self, query: impl Into<StoreQuery>, length: usize) -> Vec<Chunk> {
        match self.resolve(query.into()) {
            Some(start) => {
                let end = start.saturating_add(length).min(self.chunks.len());
                self.slice(start..end)
            }
            None => Vec::new(),
        }
    }

    /// Offset of the chunk that best matches `ts`.
    pub fn offset_of_timestamp(&self, ts: i64) -> Option<usize> {
        let index = self.index_of_timestamp(ts)?;
        Some(self.chunks.len() - 1 - index)
    }

    /// Frozen copy of every stored chunk, oldest-first.
    ///
    /// Payloads are reference-counted and immutable, so the copy is detached
    /// from later inserts and evictions.
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.chunks.iter().cloned().collect()
    }

    /// Removes every chunk. Counters and the length bound are kept.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Index of the first chunk newer than `ts`.
    pub(crate) fn index_after(&self, ts: i64) -> usize {
        self.chunks.partition_point(|chunk| chunk.ts <= ts)
    }

    /// Index of the chunk at `offset`, without clamping.
    pub(crate) fn index_of_offset(&self, offset: usize) -> Option<usize> {
        self.chunks.len().checked_sub(1)?.checked_sub(offset)
    }

    pub(crate) fn slice(&self, range: Range<usize>) -> Vec<Chunk> {
        self.chunks.range(range).cloned().collect()
    }

    fn resolve(&self, query: StoreQuery) -> Option<usize> {
        match query {
            StoreQuery::Offset(offset) => {
                let newest = self.chunks.len().checked_sub(1)?;
                Some(newest - offset.min(newest))
            }
            StoreQuery::Timestamp(ts) => self.index_of_timestamp(ts),
        }
    }

    fn position_of_ts(&self, ts: i64) -> Option<usize> {
        self.chunks.binary_search_by_key(&ts, |c| c.ts).ok()
    }

    /// Binary search for the chunk whose window contains `ts`, falling back
    /// to whichever neighbour has the nearer edge.
    fn index_of_timestamp(&self, ts: i64) -> Option<usize> {
        if self.chunks.is_empty() {
            return None;
        }

        let after = self.index_after(ts);
        if after == 0 {
            return Some(0);
        }

        let before = after - 1;
        let candidate = &self.chunks[before];
        if candidate.contains(ts) || after == self.chunks.len() {
            return Some(before);
        }

        let next = &self.chunks[after];
        let gap_before = ts as f64 - candidate.end_ts();
        let gap_after = (next.ts - ts) as f64;
        if gap_after < gap_before {
            Some(after)
        } else {
            Some(before)
        }
    }

    fn enforce_max_length(&mut self) {
        while self.chunks.len() > self.max_length {
            if let Some(evicted) = self.chunks.pop_front() {
                self.counters.evicted += 1;
                debug!(
                    "Evicted chunk at ts {} ({} bytes), {} remain",
                    evicted.ts,
                    evicted.len(),
                    self.chunks.len()
                );
            }
        }
    }
}
