//! Per-stream rewind buffer
//!
//! Couples a [`ChunkStore`] with the stream's encoding vitals and the set of
//! attached listeners. Every mutation and query runs under one lock, so a
//! listener never observes a half-applied insert or eviction and its seed
//! window is always queued before any live chunk.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RewindError;
use super::chunk::{Chunk, ChunkMeta, Vitals};
use super::rewinder::{ListenOptions, ListenerQueue, Rewinder};
use super::stats::{BufferStatus, ListenerReport};
use super::store::{ChunkStore, InsertOutcome};
use super::wire::{LoaderFrame, RewindHeader, RewindLoader, RewindWriter};
use crate::config::RewindConfig;

/// Chunk duration assumed for sizing until a source reports vitals. Shorter
/// than any encoder's frame group, so the window is never cut short.
const FALLBACK_CHUNK_SECONDS: f64 = 0.02;

/// What [`RewindBuffer::update_vitals`] did with the reported encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VitalsChange {
    /// First vitals for this buffer.
    Initial,
    /// Same stream key; buffered audio kept.
    Compatible,
    /// Stream key changed; buffered audio discarded.
    Reset { discarded: usize },
}

/// Outcome of a [`RewindBuffer::preload`] transfer.
#[derive(Debug, Clone, Default)]
pub struct PreloadSummary {
    pub header: Option<RewindHeader>,
    pub chunks_loaded: usize,
    pub chunks_skipped: usize,
    /// Transport or format failure that ended the transfer early.
    pub error: Option<String>,
}

impl PreloadSummary {
    /// True if the transfer reached a clean end of stream.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.header.is_some()
    }
}

struct ListenerSlot {
    queue: Arc<ListenerQueue>,
    /// Chunks behind live this listener is held at.
    offset: usize,
    /// Timestamp of the newest chunk already queued for this listener.
    cursor: Option<i64>,
}

struct BufferState {
    store: ChunkStore,
    vitals: Option<Vitals>,
    buffer_seconds: f64,
    listeners: HashMap<Uuid, ListenerSlot>,
    current_meta: Option<ChunkMeta>,
    destroyed: bool,
}

impl BufferState {
    fn seconds_to_offset(&self, seconds: f64) -> usize {
        self.vitals
            .as_ref()
            .map_or(0, |vitals| vitals.seconds_to_offset(seconds))
    }

    /// Clamps to the oldest buffered chunk.
    fn clamp_offset(&self, offset: usize) -> usize {
        offset.min(self.store.len().saturating_sub(1))
    }

    fn validate_offset(&self, offset: i64) -> usize {
        usize::try_from(offset).map_or(0, |offset| self.clamp_offset(offset))
    }

    fn get_chunks(&self, offset: usize, length: usize) -> Vec<Chunk> {
        if offset == 0 || length == 0 {
            return Vec::new();
        }
        self.store.range(self.clamp_offset(offset), length)
    }

    fn adjust_buffer_size(&mut self) {
        let chunk_duration = self
            .vitals
            .as_ref()
            .map_or(FALLBACK_CHUNK_SECONDS, |vitals| vitals.chunk_duration);
        let max_chunks = ((self.buffer_seconds / chunk_duration).round() as usize).max(1);
        self.store.set_max_length(max_chunks);
    }

    /// Queues for every live listener the chunks between its cursor and its
    /// offset position.
    fn fan_out(&mut self) {
        let BufferState {
            store, listeners, ..
        } = self;

        for slot in listeners.values_mut() {
            let Some(target) = store.index_of_offset(slot.offset) else {
                continue;
            };
            let first = slot.cursor.map_or(target, |ts| store.index_after(ts));
            if first > target {
                continue;
            }
            let chunks = store.slice(first..target + 1);
            slot.cursor = chunks.last().map(|c| c.ts);
            slot.queue.enqueue(chunks);
        }
    }

    fn forget_cursors(&mut self) {
        for slot in self.listeners.values_mut() {
            slot.cursor = None;
        }
    }
}

/// Rewind history and listener fan-out for one stream.
pub struct RewindBuffer {
    name: String,
    read_size: usize,
    state: Mutex<BufferState>,
    loading: watch::Sender<bool>,
}

impl RewindBuffer {
    /// Creates an empty buffer. Until vitals arrive its length bound assumes
    /// very short chunks; the first vitals tighten it.
    pub fn new(name: impl Into<String>, config: &RewindConfig) -> Self {
        let (loading, _) = watch::channel(false);
        let mut state = BufferState {
            store: ChunkStore::default(),
            vitals: None,
            buffer_seconds: config.buffer_seconds,
            listeners: HashMap::new(),
            current_meta: None,
            destroyed: false,
        };
        state.adjust_buffer_size();
        Self {
            name: name.into(),
            read_size: config.read_size,
            state: Mutex::new(state),
            loading,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores a live chunk and delivers it to attached listeners.
    ///
    /// # Errors
    ///
    /// - `RewindError::Destroyed` - Buffer was destroyed
    /// - `RewindError::OutOfOrder` - Chunk falls inside the buffered span
    pub fn push(&self, chunk: Chunk) -> Result<InsertOutcome, RewindError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(RewindError::Destroyed {
                stream: self.name.clone(),
            });
        }

        let ts = chunk.ts;
        let meta = chunk.meta.clone();
        let outcome = state.store.insert(chunk);
        match outcome {
            InsertOutcome::OutOfOrder => return Err(RewindError::OutOfOrder { ts }),
            InsertOutcome::Appended => {
                if meta.is_some() && meta != state.current_meta {
                    debug!("{}: metadata changed to {:?}", self.name, meta);
                    state.current_meta = meta;
                }
                state.fan_out();
            }
            InsertOutcome::Prepended | InsertOutcome::Duplicate => {}
        }
        Ok(outcome)
    }

    /// Applies newly reported encoding vitals.
    ///
    /// A different stream key means the source reconnected with an
    /// incompatible encoding; the buffered audio is discarded so the two are
    /// never mixed. A matching key keeps the buffer as-is.
    ///
    /// # Errors
    ///
    /// - `RewindError::InvalidVitals` - Chunk duration is not a positive number
    pub fn update_vitals(&self, vitals: Vitals) -> Result<VitalsChange, RewindError> {
        if !vitals.is_usable() {
            return Err(RewindError::InvalidVitals {
                stream_key: vitals.stream_key,
                chunk_duration: vitals.chunk_duration,
            });
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let change = match &state.vitals {
            None => VitalsChange::Initial,
            Some(current) if current.stream_key == vitals.stream_key => VitalsChange::Compatible,
            Some(current) => {
                let discarded = state.store.len();
                info!(
                    "{}: stream key changed from {} to {}, discarding {} buffered chunks",
                    self.name, current.stream_key, vitals.stream_key, discarded
                );
                state.store.clear();
                state.forget_cursors();
                VitalsChange::Reset { discarded }
            }
        };

        state.vitals = Some(vitals);
        state.adjust_buffer_size();
        debug!(
            "{}: vitals applied ({:?}), max {} chunks",
            self.name,
            change,
            state.store.max_length()
        );
        Ok(change)
    }

    /// Recomputes the length bound from the rewind window and chunk duration.
    pub fn adjust_buffer_size(&self) {
        self.state.lock().adjust_buffer_size();
    }

    /// Changes the rewind window, evicting immediately if it shrank.
    pub fn set_buffer_seconds(&self, buffer_seconds: f64) {
        let mut state = self.state.lock();
        state.buffer_seconds = buffer_seconds;
        state.adjust_buffer_size();
    }

    pub fn vitals(&self) -> Option<Vitals> {
        self.state.lock().vitals.clone()
    }

    /// Clamps a chunk offset into the buffered span.
    ///
    /// Negative requests clamp to live, requests past the oldest chunk to the
    /// oldest chunk. An empty buffer yields 0.
    pub fn validate_offset(&self, offset: i64) -> usize {
        self.state.lock().validate_offset(offset)
    }

    /// Converts seconds behind live to a clamped chunk offset.
    pub fn validate_seconds_offset(&self, seconds: f64) -> usize {
        let state = self.state.lock();
        let offset = state.seconds_to_offset(seconds);
        state.clamp_offset(offset)
    }

    /// Converts seconds to chunks with the current vitals (0 without vitals).
    pub fn seconds_to_offset(&self, seconds: f64) -> usize {
        self.state.lock().seconds_to_offset(seconds)
    }

    /// Converts chunks to seconds with the current vitals.
    pub fn offset_to_seconds(&self, offset: usize) -> Option<f64> {
        self.state
            .lock()
            .vitals
            .as_ref()
            .map(|vitals| vitals.offset_to_seconds(offset))
    }

    /// Offset of the chunk covering `ts`, or its nearest neighbour.
    pub fn timestamp_to_offset(&self, ts: i64) -> Option<usize> {
        self.state.lock().store.offset_of_timestamp(ts)
    }

    /// Up to `length` chunks starting `offset` chunks behind live, oldest
    /// first. Offset or length 0 yields nothing.
    pub fn get_chunks(&self, offset: usize, length: usize) -> Vec<Chunk> {
        self.state.lock().get_chunks(offset, length)
    }

    /// [`get_chunks`](Self::get_chunks) with both arguments in seconds.
    pub fn get_seconds(&self, offset_secs: f64, length_secs: f64) -> Vec<Chunk> {
        let state = self.state.lock();
        let offset = state.seconds_to_offset(offset_secs);
        let length = state.seconds_to_offset(length_secs);
        state.get_chunks(offset, length)
    }

    /// Snapshot of the buffer as a dump stream carrying the current vitals.
    ///
    /// # Errors
    ///
    /// - `RewindError::NoVitals` - Nothing describes the buffered audio yet
    pub fn dump(&self) -> Result<RewindWriter, RewindError> {
        let state = self.state.lock();
        let vitals = state.vitals.clone().ok_or_else(|| RewindError::NoVitals {
            stream: self.name.clone(),
        })?;
        let snapshot = state.store.snapshot();
        drop(state);

        info!("{}: dumping {} chunks", self.name, snapshot.len());
        Ok(RewindWriter::new(vitals, snapshot).with_read_size(self.read_size))
    }

    /// Replaces the buffered audio with the contents of a dump stream.
    ///
    /// Listeners calling [`listen`](Self::listen) wait until this returns.
    /// Transport and format errors end the transfer early but are not fatal:
    /// whatever chunks parsed completely stay loaded.
    pub async fn preload<S, E>(&self, mut source: S) -> PreloadSummary
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let _loading = {
            let mut state = self.state.lock();
            state.store.clear();
            LoadingGuard::engage(&self.loading)
        };

        let mut loader = RewindLoader::new();
        let mut summary = PreloadSummary::default();

        'transfer: loop {
            match source.next().await {
                Some(Ok(bytes)) => {
                    loader.feed(&bytes);
                    loop {
                        match loader.next_frame() {
                            Ok(Some(frame)) => {
                                if let Err(e) = self.apply_frame(frame, &mut summary) {
                                    warn!("{}: preload stopped: {}", self.name, e);
                                    summary.error = Some(e.to_string());
                                    break 'transfer;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("{}: malformed preload stream: {}", self.name, e);
                                summary.error = Some(e.to_string());
                                break 'transfer;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("{}: preload transfer failed: {}", self.name, e);
                    summary.error = Some(e.to_string());
                    break;
                }
                None => {
                    if let Err(e) = loader.finish() {
                        warn!("{}: preload stream ended early: {}", self.name, e);
                        summary.error = Some(e.to_string());
                    }
                    break;
                }
            }
        }

        info!(
            "{}: preloaded {} chunks ({} skipped){}",
            self.name,
            summary.chunks_loaded,
            summary.chunks_skipped,
            if summary.is_complete() { "" } else { ", transfer incomplete" }
        );
        summary
    }

    fn apply_frame(
        &self,
        frame: LoaderFrame,
        summary: &mut PreloadSummary,
    ) -> Result<(), RewindError> {
        match frame {
            LoaderFrame::Header(header) => {
                self.update_vitals(header.vitals.clone())?;
                summary.header = Some(header);
            }
            LoaderFrame::Chunk(chunk) => {
                let mut state = self.state.lock();
                if state.destroyed {
                    return Err(RewindError::Destroyed {
                        stream: self.name.clone(),
                    });
                }
                if state.store.insert(chunk).is_stored() {
                    summary.chunks_loaded += 1;
                } else {
                    summary.chunks_skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// True while a preload is running.
    pub fn is_loading(&self) -> bool {
        *self.loading.borrow()
    }

    /// Resolves once no preload is running.
    pub async fn ready(&self) {
        let mut loading = self.loading.subscribe();
        let _ = loading.wait_for(|loading| !*loading).await;
    }

    /// Waits for any preload to finish, then attaches and seeds a listener.
    /// A preload starting between the two puts the listener back to waiting.
    ///
    /// # Errors
    ///
    /// - `RewindError::Destroyed` - Buffer was destroyed
    pub async fn listen(self: &Arc<Self>, options: ListenOptions) -> Result<Rewinder, RewindError> {
        let mut rewinder = Rewinder::new(Arc::clone(self), options).with_read_size(self.read_size);
        loop {
            self.ready().await;
            match rewinder.pump() {
                Ok(_) => return Ok(rewinder),
                Err(RewindError::Loading { .. }) => {
                    debug!("{}: preload started, listener {} waits", self.name, rewinder.id());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Seeds `queue` and, unless it is a one-shot download, registers it for
    /// live delivery. Returns the number of seeded chunks.
    ///
    /// Refused while a preload runs; the loading flag is raised under the
    /// same lock, so a seed never lands in a window about to be replaced.
    pub(crate) fn attach_listener(
        &self,
        id: Uuid,
        queue: &Arc<ListenerQueue>,
        options: &ListenOptions,
    ) -> Result<usize, RewindError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(RewindError::Destroyed {
                stream: self.name.clone(),
            });
        }

        if *self.loading.borrow() {
            return Err(RewindError::Loading {
                stream: self.name.clone(),
            });
        }

        let requested = match options.timestamp {
            Some(ts) => state.store.offset_of_timestamp(ts).unwrap_or(0),
            None => state.seconds_to_offset(options.offset_secs),
        };
        let offset = state.clamp_offset(requested);
        let burst = state.seconds_to_offset(options.initial_burst_secs);

        let seed = match options.timestamp {
            // starts at the covering chunk, the newest one included
            Some(_) => state.store.range(offset, burst),
            // live listeners take their burst from the chunks just behind live
            None if offset == 0 => state.get_chunks(burst, burst),
            None => state.get_chunks(offset, burst),
        };
        let seeded = seed.len();
        let cursor = seed.last().map(|c| c.ts);
        queue.enqueue(seed);

        if options.pump_and_finish {
            queue.finish();
        } else {
            state.listeners.insert(
                id,
                ListenerSlot {
                    queue: Arc::clone(queue),
                    offset,
                    cursor,
                },
            );
        }
        Ok(seeded)
    }

    pub(crate) fn detach_listener(&self, id: Uuid) {
        self.state.lock().listeners.remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Per-listener accounting since the previous call.
    pub fn listener_reports(&self) -> Vec<ListenerReport> {
        let state = self.state.lock();
        state
            .listeners
            .iter()
            .map(|(id, slot)| {
                let (interval, total) = slot.queue.take_interval();
                ListenerReport {
                    id: *id,
                    offset: slot.offset,
                    queued_bytes: slot.queue.queued_bytes(),
                    interval,
                    total,
                }
            })
            .collect()
    }

    /// Closes every listener whose undelivered audio exceeds `max_queued_bytes`.
    pub fn disconnect_slow_listeners(&self, max_queued_bytes: usize) -> Vec<Uuid> {
        let mut state = self.state.lock();
        let slow: Vec<Uuid> = state
            .listeners
            .iter()
            .filter(|(_, slot)| slot.queue.queued_bytes() > max_queued_bytes)
            .map(|(id, _)| *id)
            .collect();

        for id in &slow {
            if let Some(slot) = state.listeners.remove(id) {
                warn!(
                    "{}: disconnecting listener {} with {} bytes queued",
                    self.name,
                    id,
                    slot.queue.queued_bytes()
                );
                slot.queue.close();
            }
        }
        slow
    }

    /// Newest now-playing metadata seen on a live chunk.
    pub fn current_meta(&self) -> Option<ChunkMeta> {
        self.state.lock().current_meta.clone()
    }

    /// Discards all buffered audio. Vitals are kept for the next push.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let discarded = state.store.len();
        state.store.clear();
        state.forget_cursors();
        info!("{}: reset, discarded {} chunks", self.name, discarded);
    }

    /// Buffered span and listener count for monitoring.
    pub fn status(&self) -> BufferStatus {
        let state = self.state.lock();
        let chunk_duration = state.vitals.as_ref().map_or(0.0, |v| v.chunk_duration);
        BufferStatus {
            stream: self.name.clone(),
            buffered_chunks: state.store.len(),
            max_chunks: state.store.max_length(),
            buffered_seconds: state.store.len() as f64 * chunk_duration,
            first_ts: state.store.first().map(|c| c.ts),
            last_ts: state.store.last().map(|c| c.ts),
            vitals: state.vitals.clone(),
            listeners: state.listeners.len(),
            loading: *self.loading.borrow(),
            counters: state.store.counters(),
        }
    }

    /// Rejects further pushes and ends every attached listener.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.store.clear();
        for (_, slot) in state.listeners.drain() {
            slot.queue.close();
        }
        info!("{}: rewind buffer destroyed", self.name);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

/// Holds the loading flag up for the lifetime of a preload, including when
/// the preload future is dropped mid-transfer.
struct LoadingGuard<'a> {
    loading: &'a watch::Sender<bool>,
}

impl<'a> LoadingGuard<'a> {
    fn engage(loading: &'a watch::Sender<bool>) -> Self {
        loading.send_replace(true);
        Self { loading }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.loading.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::stream;

    use super::*;
    use crate::rewind::stats::ListenStats;

    fn buffer() -> RewindBuffer {
        let buffer = RewindBuffer::new("test", &RewindConfig::default());
        buffer.update_vitals(Vitals::new("mp3-128", 1.0)).unwrap();
        buffer
    }

    fn push_range(buffer: &RewindBuffer, range: std::ops::Range<i64>) {
        for i in range {
            buffer
                .push(Chunk::new(i * 1000, 1000.0, vec![i as u8; 4]))
                .unwrap();
        }
    }

    fn dump_bytes(buffer: &RewindBuffer) -> Vec<Bytes> {
        let mut writer = buffer.dump().unwrap();
        let mut parts = Vec::new();
        while let Some(part) = writer.read(64).unwrap() {
            parts.push(part);
        }
        parts
    }

    #[test]
    fn test_push_after_destroy_fails() {
        let buffer = buffer();
        buffer.destroy();
        assert!(matches!(
            buffer.push(Chunk::new(0, 1000.0, vec![0])),
            Err(RewindError::Destroyed { .. })
        ));
    }

    #[test]
    fn test_out_of_order_push_is_reported() {
        let buffer = buffer();
        buffer.push(Chunk::new(0, 1000.0, vec![0])).unwrap();
        buffer.push(Chunk::new(2000, 1000.0, vec![0])).unwrap();
        assert!(matches!(
            buffer.push(Chunk::new(1000, 1000.0, vec![0])),
            Err(RewindError::OutOfOrder { ts: 1000 })
        ));
        assert_eq!(buffer.status().buffered_chunks, 2);
    }

    #[test]
    fn test_buffer_size_follows_vitals() {
        let config = RewindConfig {
            buffer_seconds: 10.0,
            ..RewindConfig::default()
        };
        let buffer = RewindBuffer::new("test", &config);
        buffer.update_vitals(Vitals::new("k", 0.5)).unwrap();
        assert_eq!(buffer.status().max_chunks, 20);

        push_range(&buffer, 0..30);
        assert_eq!(buffer.status().buffered_chunks, 20);

        buffer.set_buffer_seconds(5.0);
        assert_eq!(buffer.status().buffered_chunks, 10);
        assert_eq!(buffer.status().first_ts, Some(20_000));
    }

    #[test]
    fn test_incompatible_vitals_reset() {
        let buffer = RewindBuffer::new("test", &RewindConfig::default());
        assert_eq!(
            buffer.update_vitals(Vitals::new("A", 1.0)).unwrap(),
            VitalsChange::Initial
        );
        push_range(&buffer, 0..5);

        assert_eq!(
            buffer.update_vitals(Vitals::new("A", 1.0)).unwrap(),
            VitalsChange::Compatible
        );
        assert_eq!(buffer.status().buffered_chunks, 5);

        assert_eq!(
            buffer.update_vitals(Vitals::new("B", 1.0)).unwrap(),
            VitalsChange::Reset { discarded: 5 }
        );
        assert_eq!(buffer.status().buffered_chunks, 0);
    }

    #[test]
    fn test_invalid_vitals_rejected() {
        let buffer = RewindBuffer::new("test", &RewindConfig::default());
        assert!(matches!(
            buffer.update_vitals(Vitals::new("A", -1.0)),
            Err(RewindError::InvalidVitals { .. })
        ));
        assert!(buffer.vitals().is_none());
    }

    #[test]
    fn test_validate_offset_clamps() {
        let buffer = buffer();
        assert_eq!(buffer.validate_offset(5), 0);

        push_range(&buffer, 0..10);
        assert_eq!(buffer.validate_offset(-3), 0);
        assert_eq!(buffer.validate_offset(4), 4);
        assert_eq!(buffer.validate_offset(400), 9);
        assert_eq!(buffer.validate_seconds_offset(2.4), 2);
    }

    #[test]
    fn test_offsets_past_i64_clamp_to_oldest() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..10);

        assert_eq!(buffer.validate_seconds_offset(1e19), 9);
        assert_eq!(buffer.validate_offset(i64::MAX), 9);
        let ts: Vec<i64> = buffer.get_seconds(1e19, 2.0).iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![0, 1000]);
        let ts: Vec<i64> = buffer.get_chunks(usize::MAX, 2).iter().map(|c| c.ts).collect();
        assert_eq!(ts, vec![0, 1000]);

        let mut rewinder = Rewinder::new(
            Arc::clone(&buffer),
            ListenOptions::rewound(1e19).with_burst(2.0),
        );
        assert_eq!(rewinder.pump().unwrap(), 2);
        assert_eq!(
            rewinder.read(1024),
            crate::rewind::ReadOutcome::Data(Bytes::from(vec![0u8, 0, 0, 0, 1, 1, 1, 1]))
        );
    }

    #[test]
    fn test_get_chunks_edges() {
        let buffer = buffer();
        assert!(buffer.get_chunks(3, 2).is_empty());

        push_range(&buffer, 0..10);
        assert!(buffer.get_chunks(0, 5).is_empty());
        assert!(buffer.get_chunks(5, 0).is_empty());

        let oldest: Vec<i64> = buffer.get_chunks(99, 2).iter().map(|c| c.ts).collect();
        assert_eq!(oldest, vec![0, 1000]);
    }

    #[test]
    fn test_dump_requires_vitals() {
        let buffer = RewindBuffer::new("test", &RewindConfig::default());
        assert!(matches!(buffer.dump(), Err(RewindError::NoVitals { .. })));
    }

    #[tokio::test]
    async fn test_preload_round_trip() {
        let source = buffer();
        push_range(&source, 0..8);
        let parts = dump_bytes(&source);

        let target = RewindBuffer::new("replica", &RewindConfig::default());
        let summary = target
            .preload(stream::iter(parts.into_iter().map(Ok::<_, Infallible>)))
            .await;

        assert!(summary.is_complete());
        assert_eq!(summary.chunks_loaded, 8);
        assert_eq!(target.vitals(), source.vitals());
        assert_eq!(target.status().first_ts, Some(0));
        assert_eq!(target.status().last_ts, Some(7000));
        assert!(!target.is_loading());
    }

    #[tokio::test]
    async fn test_preload_keeps_partial_data_on_transport_error() {
        let source = buffer();
        push_range(&source, 0..6);
        let joined: Vec<u8> = dump_bytes(&source).concat();

        // header plus a few complete frames, then the transport fails mid-frame
        let cut = joined.len() - 10;
        let items: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::copy_from_slice(&joined[..cut])),
            Err("connection reset".to_string()),
        ];

        let target = RewindBuffer::new("replica", &RewindConfig::default());
        let summary = target.preload(stream::iter(items)).await;

        assert_eq!(summary.error.as_deref(), Some("connection reset"));
        assert_eq!(summary.chunks_loaded, 5);
        // newest-first transfer: the oldest chunk is the one that was lost
        assert_eq!(target.status().first_ts, Some(1000));
        assert_eq!(target.status().last_ts, Some(5000));
    }

    #[tokio::test]
    async fn test_preload_replaces_buffered_chunks() {
        let source = buffer();
        push_range(&source, 0..5);
        let parts = dump_bytes(&source);

        let target = buffer();
        push_range(&target, 5..7);
        let summary = target
            .preload(stream::iter(parts.into_iter().map(Ok::<_, Infallible>)))
            .await;
        assert_eq!(summary.chunks_loaded, 5);

        push_range(&target, 5..7);
        let status = target.status();
        assert_eq!(status.first_ts, Some(0));
        assert_eq!(status.last_ts, Some(6000));
        assert_eq!(status.buffered_chunks, 7);
    }

    #[test]
    fn test_rewound_listener_stays_behind_live() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..10);

        let mut rewinder = Rewinder::new(
            Arc::clone(&buffer),
            ListenOptions::rewound(4.0).with_burst(2.0),
        );
        rewinder.pump().unwrap();

        fn drain(rewinder: &mut Rewinder, received: &mut Vec<u8>) {
            while let crate::rewind::ReadOutcome::Data(bytes) = rewinder.read(1) {
                received.push(bytes[0]);
            }
        }

        let mut received = Vec::new();

        drain(&mut rewinder, &mut received);
        assert_eq!(received, vec![5, 6]);

        // offset 4 holds back until the chunk after the burst is 4 behind live
        push_range(&buffer, 10..11);
        drain(&mut rewinder, &mut received);
        assert_eq!(received, vec![5, 6]);

        push_range(&buffer, 11..13);
        drain(&mut rewinder, &mut received);
        assert_eq!(received, vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_timestamp_listener_starts_at_covering_chunk() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..10);

        let options = ListenOptions::live().with_burst(2.0).at_timestamp(3500);
        let mut rewinder = Rewinder::new(Arc::clone(&buffer), options);
        rewinder.pump().unwrap();

        assert_eq!(
            rewinder.read(1024),
            crate::rewind::ReadOutcome::Data(Bytes::from(vec![3u8, 3, 3, 3, 4, 4, 4, 4]))
        );
    }

    #[test]
    fn test_timestamp_listener_in_newest_chunk() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..10);

        let options = ListenOptions::live().with_burst(3.0).at_timestamp(9500);
        let mut rewinder = Rewinder::new(Arc::clone(&buffer), options);
        assert_eq!(rewinder.pump().unwrap(), 1);
        assert_eq!(
            rewinder.read(1024),
            crate::rewind::ReadOutcome::Data(Bytes::from(vec![9u8; 4]))
        );

        push_range(&buffer, 10..11);
        assert_eq!(
            rewinder.read(1024),
            crate::rewind::ReadOutcome::Data(Bytes::from(vec![10u8; 4]))
        );
    }

    #[test]
    fn test_window_is_bounded_before_vitals() {
        let config = RewindConfig {
            buffer_seconds: 1.0,
            ..RewindConfig::default()
        };
        let buffer = RewindBuffer::new("test", &config);
        assert_eq!(buffer.status().max_chunks, 50);

        for i in 0..80 {
            buffer.push(Chunk::new(i * 20, 20.0, vec![0])).unwrap();
        }
        assert_eq!(buffer.status().buffered_chunks, 50);
        assert_eq!(buffer.status().first_ts, Some(600));

        buffer.update_vitals(Vitals::new("k", 0.25)).unwrap();
        assert_eq!(buffer.status().buffered_chunks, 4);
    }

    #[test]
    fn test_slow_listeners_are_disconnected() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..10);

        let mut slow = Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(8.0));
        slow.pump().unwrap();
        let mut fast = Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(1.0));
        fast.pump().unwrap();

        let dropped = buffer.disconnect_slow_listeners(16);
        assert_eq!(dropped, vec![slow.id()]);
        assert_eq!(buffer.listener_count(), 1);
        assert_eq!(slow.read(1024), crate::rewind::ReadOutcome::Finished);
    }

    #[test]
    fn test_listener_reports_carry_interval_stats() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..10);

        let mut rewinder = Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(2.0));
        rewinder.pump().unwrap();
        rewinder.read(1024);

        let reports = buffer.listener_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].interval.bytes, 8);
        assert_eq!(reports[0].queued_bytes, 0);

        let reports = buffer.listener_reports();
        assert_eq!(reports[0].interval, ListenStats::default());
        assert_eq!(reports[0].total.bytes, 8);
    }

    #[test]
    fn test_current_meta_tracks_live_pushes() {
        let buffer = buffer();
        buffer
            .push(Chunk::new(0, 1000.0, vec![0]).with_meta(ChunkMeta::titled("First")))
            .unwrap();
        buffer.push(Chunk::new(1000, 1000.0, vec![0])).unwrap();
        assert_eq!(buffer.current_meta(), Some(ChunkMeta::titled("First")));
    }

    #[tokio::test]
    async fn test_listen_waits_for_preload() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..4);
        let parts = dump_bytes(&buffer);

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, Infallible>>();
        let preloading = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.preload(rx).await })
        };

        // wait until the preload has raised the loading flag
        while !buffer.is_loading() {
            tokio::task::yield_now().await;
        }

        let listener = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.listen(ListenOptions::live().with_burst(3.0)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!listener.is_finished());

        for part in parts {
            tx.unbounded_send(Ok(part)).unwrap();
        }
        drop(tx);

        let summary = preloading.await.unwrap();
        assert_eq!(summary.chunks_loaded, 4);

        let mut rewinder = listener.await.unwrap().unwrap();
        assert!(matches!(rewinder.read(1024), crate::rewind::ReadOutcome::Data(_)));
    }

    #[tokio::test]
    async fn test_pump_is_refused_while_preloading() {
        let buffer = Arc::new(buffer());
        push_range(&buffer, 0..4);
        let parts = dump_bytes(&buffer);

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, Infallible>>();
        let preloading = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.preload(rx).await })
        };
        while !buffer.is_loading() {
            tokio::task::yield_now().await;
        }

        let mut rewinder = Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(2.0));
        assert!(matches!(rewinder.pump(), Err(RewindError::Loading { .. })));
        assert_eq!(buffer.listener_count(), 0);

        for part in parts {
            tx.unbounded_send(Ok(part)).unwrap();
        }
        drop(tx);
        preloading.await.unwrap();

        assert_eq!(rewinder.pump().unwrap(), 2);
        assert_eq!(buffer.listener_count(), 1);
    }
}
