//! Per-listener pull stream over a rewind buffer
//!
//! The buffer pushes chunks into each listener's queue as they arrive; the
//! listener's transport pulls bytes out at whatever pace its socket allows.
//! An empty queue is reported as [`ReadOutcome::Idle`] while more audio can
//! still arrive, and as [`ReadOutcome::Finished`] only once it never will.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::RewindError;
use super::buffer::RewindBuffer;
use super::chunk::Chunk;
use super::stats::ListenStats;

/// Bytes handed out per stream poll unless configured otherwise.
const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Where and how a listener joins a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenOptions {
    /// Seconds behind live to hold the listener at.
    pub offset_secs: f64,
    /// Seconds of audio to deliver immediately on connect.
    pub initial_burst_secs: f64,
    /// Serve the initial burst only, then end the stream.
    pub pump_and_finish: bool,
    /// Start at the chunk covering this epoch-millisecond instant instead of
    /// `offset_secs`.
    pub timestamp: Option<i64>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            offset_secs: 0.0,
            initial_burst_secs: 15.0,
            pump_and_finish: false,
            timestamp: None,
        }
    }
}

impl ListenOptions {
    /// A listener at the live edge.
    pub fn live() -> Self {
        Self::default()
    }

    /// A listener held `offset_secs` behind live.
    pub fn rewound(offset_secs: f64) -> Self {
        Self {
            offset_secs,
            ..Self::default()
        }
    }

    /// A one-shot download of the `seconds` of audio behind live.
    pub fn download(seconds: f64) -> Self {
        Self {
            offset_secs: seconds,
            initial_burst_secs: seconds,
            pump_and_finish: true,
            timestamp: None,
        }
    }

    pub fn with_burst(mut self, initial_burst_secs: f64) -> Self {
        self.initial_burst_secs = initial_burst_secs;
        self
    }

    pub fn at_timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }
}

/// Result of one pull from a listener queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Whole chunk payloads, concatenated in arrival order.
    Data(Bytes),
    /// Nothing queued right now; the stream is still open.
    Idle,
    /// Nothing queued and nothing more will ever be.
    Finished,
}

/// Lifecycle of a [`Rewinder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewinderState {
    /// Created but not yet seeded from the buffer.
    Seeding,
    /// Seeded; following live pushes or draining a one-shot burst.
    Streaming,
    /// Detached and drained.
    Closed,
}

/// Chunk FIFO shared between a buffer's fan-out and one listener.
///
/// The buffer only enqueues; the listener only drains. The lock is the
/// single-flight guard for draining.
#[derive(Debug, Default)]
pub(crate) struct ListenerQueue {
    inner: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<Chunk>,
    queued_bytes: usize,
    closed: bool,
    finish_when_empty: bool,
    waker: Option<Waker>,
    total: ListenStats,
    interval: ListenStats,
}

impl ListenerQueue {
    pub(crate) fn enqueue(&self, chunks: impl IntoIterator<Item = Chunk>) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        for chunk in chunks {
            state.queued_bytes += chunk.len();
            state.chunks.push_back(chunk);
        }
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Marks that no further chunks will be enqueued; reads finish once the
    /// queue drains.
    pub(crate) fn finish(&self) {
        let mut state = self.inner.lock();
        state.finish_when_empty = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Drops everything queued and ends the stream immediately.
    pub(crate) fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.chunks.clear();
        state.queued_bytes = 0;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.inner.lock().queued_bytes
    }

    pub(crate) fn total(&self) -> ListenStats {
        self.inner.lock().total
    }

    /// Returns and resets the stats accumulated since the last call.
    pub(crate) fn take_interval(&self) -> (ListenStats, ListenStats) {
        let mut state = self.inner.lock();
        let interval = std::mem::take(&mut state.interval);
        (interval, state.total)
    }

    /// Drains whole chunks until at least `size` bytes are collected.
    ///
    /// When the queue is empty and still open, `waker` is registered to be
    /// woken by the next enqueue.
    fn poll_read(&self, size: usize, waker: Option<&Waker>) -> ReadOutcome {
        let mut state = self.inner.lock();
        if state.closed {
            return ReadOutcome::Finished;
        }

        let Some(first) = state.chunks.pop_front() else {
            if state.finish_when_empty {
                return ReadOutcome::Finished;
            }
            if let Some(waker) = waker {
                state.waker = Some(waker.clone());
            }
            return ReadOutcome::Idle;
        };

        let mut delivered = vec![first];
        let mut len = delivered[0].len();
        while len < size {
            let Some(next) = state.chunks.pop_front() else {
                break;
            };
            len += next.len();
            delivered.push(next);
        }

        state.queued_bytes = state.queued_bytes.saturating_sub(len);
        for chunk in &delivered {
            state.total.record(chunk.len(), chunk.duration);
            state.interval.record(chunk.len(), chunk.duration);
        }

        if delivered.len() == 1 {
            return ReadOutcome::Data(delivered.remove(0).data);
        }
        let mut out = BytesMut::with_capacity(len);
        for chunk in delivered {
            out.extend_from_slice(&chunk.data);
        }
        ReadOutcome::Data(out.freeze())
    }
}

/// One listener's position in a stream.
///
/// Call [`pump`](Self::pump) to seed it, then consume it as a byte stream.
/// Dropping it detaches it from the buffer.
pub struct Rewinder {
    id: Uuid,
    buffer: Arc<RewindBuffer>,
    queue: Arc<ListenerQueue>,
    options: ListenOptions,
    state: RewinderState,
    read_size: usize,
    connected_at: DateTime<Utc>,
}

impl Rewinder {
    /// Creates an unseeded listener against `buffer`.
    pub fn new(buffer: Arc<RewindBuffer>, options: ListenOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            buffer,
            queue: Arc::new(ListenerQueue::default()),
            options,
            state: RewinderState::Seeding,
            read_size: DEFAULT_READ_SIZE,
            connected_at: Utc::now(),
        }
    }

    /// Sets how many bytes each stream poll aims to hand out.
    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &ListenOptions {
        &self.options
    }

    pub fn state(&self) -> RewinderState {
        self.state
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Seeds the queue with the initial burst and, unless pumping a one-shot
    /// download, subscribes to live pushes.
    ///
    /// Seeding and subscribing happen under the buffer's lock, so history is
    /// always queued before any live chunk. Returns the seeded chunk count.
    ///
    /// # Errors
    ///
    /// - `RewindError::Destroyed` - Buffer was destroyed
    /// - `RewindError::Loading` - A preload is running; the rewinder stays
    ///   unseeded and may pump again once it ends
    pub fn pump(&mut self) -> Result<usize, RewindError> {
        if self.state != RewinderState::Seeding {
            return Ok(0);
        }
        let seeded = self
            .buffer
            .attach_listener(self.id, &self.queue, &self.options)?;
        self.state = RewinderState::Streaming;

        debug!(
            "Listener {} seeded with {} chunks (offset {}s, burst {}s{})",
            self.id,
            seeded,
            self.options.offset_secs,
            self.options.initial_burst_secs,
            if self.options.pump_and_finish { ", one-shot" } else { "" }
        );
        Ok(seeded)
    }

    /// Appends chunks to this listener's queue outside the buffer's fan-out.
    pub fn enqueue_chunk(&self, chunk: Chunk) {
        self.queue.enqueue([chunk]);
    }

    /// Pulls up to roughly `size` bytes of whole chunks.
    pub fn read(&mut self, size: usize) -> ReadOutcome {
        match self.state {
            RewinderState::Seeding => ReadOutcome::Idle,
            RewinderState::Streaming => self.queue.poll_read(size, None),
            RewinderState::Closed => ReadOutcome::Finished,
        }
    }

    /// Bytes waiting to be read.
    pub fn queued_bytes(&self) -> usize {
        self.queue.queued_bytes()
    }

    /// Totals delivered since connect.
    pub fn stats(&self) -> ListenStats {
        self.queue.total()
    }

    /// Stats delivered since the previous call, for periodic session
    /// accounting.
    pub fn take_interval_stats(&self) -> ListenStats {
        self.queue.take_interval().0
    }

    /// Detaches from the buffer, drops queued audio and ends the stream.
    ///
    /// Returns the session totals. Calling it again is a no-op.
    pub fn destroy(&mut self) -> ListenStats {
        let stats = self.queue.total();
        if self.state == RewinderState::Closed {
            return stats;
        }

        self.buffer.detach_listener(self.id);
        self.queue.close();
        self.state = RewinderState::Closed;

        let elapsed = Utc::now().signed_duration_since(self.connected_at);
        info!(
            "Listener {} on {} disconnected after {}s: {} bytes, {:.1}s of audio",
            self.id,
            self.buffer.name(),
            elapsed.num_seconds(),
            stats.bytes,
            stats.seconds
        );
        stats
    }
}

impl Stream for Rewinder {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let outcome = match this.state {
            RewinderState::Seeding => {
                if let Err(e) = this.pump() {
                    this.state = RewinderState::Closed;
                    return Poll::Ready(Some(Err(io::Error::other(e))));
                }
                this.queue.poll_read(this.read_size, Some(cx.waker()))
            }
            RewinderState::Streaming => this.queue.poll_read(this.read_size, Some(cx.waker())),
            RewinderState::Closed => ReadOutcome::Finished,
        };

        match outcome {
            ReadOutcome::Data(bytes) => Poll::Ready(Some(Ok(bytes))),
            ReadOutcome::Idle => Poll::Pending,
            ReadOutcome::Finished => Poll::Ready(None),
        }
    }
}

impl Drop for Rewinder {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::config::RewindConfig;
    use crate::rewind::chunk::Vitals;

    fn buffer_with(count: i64) -> Arc<RewindBuffer> {
        let buffer = Arc::new(RewindBuffer::new("test", &RewindConfig::default()));
        buffer.update_vitals(Vitals::new("mp3-128", 1.0)).unwrap();
        for i in 0..count {
            buffer
                .push(Chunk::new(i * 1000, 1000.0, vec![i as u8; 10]))
                .unwrap();
        }
        buffer
    }

    fn first_bytes(outcome: ReadOutcome) -> Vec<u8> {
        match outcome {
            ReadOutcome::Data(bytes) => bytes.to_vec(),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_unpumped_rewinder_is_idle() {
        let buffer = buffer_with(3);
        let mut rewinder = Rewinder::new(buffer, ListenOptions::live());
        assert_eq!(rewinder.state(), RewinderState::Seeding);
        assert_eq!(rewinder.read(1024), ReadOutcome::Idle);
    }

    #[test]
    fn test_live_listener_gets_burst_then_live() {
        let buffer = buffer_with(10);
        let mut rewinder = Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(3.0));
        assert_eq!(rewinder.pump().unwrap(), 3);

        // burst covers offsets 3..1, one chunk per read
        assert_eq!(first_bytes(rewinder.read(1)), vec![6u8; 10]);
        assert_eq!(first_bytes(rewinder.read(1)), vec![7u8; 10]);
        assert_eq!(first_bytes(rewinder.read(1)), vec![8u8; 10]);
        assert_eq!(rewinder.read(1), ReadOutcome::Idle);

        // the next push delivers the chunk that was newest at connect, then itself
        buffer.push(Chunk::new(10_000, 1000.0, vec![10u8; 10])).unwrap();
        assert_eq!(first_bytes(rewinder.read(1)), vec![9u8; 10]);
        assert_eq!(first_bytes(rewinder.read(1)), vec![10u8; 10]);
        assert_eq!(rewinder.read(1), ReadOutcome::Idle);
    }

    #[test]
    fn test_read_concatenates_whole_chunks() {
        let buffer = buffer_with(10);
        let mut rewinder = Rewinder::new(buffer, ListenOptions::live().with_burst(4.0));
        rewinder.pump().unwrap();

        let data = first_bytes(rewinder.read(25));
        assert_eq!(data.len(), 30);
        assert_eq!(rewinder.queued_bytes(), 10);
        assert_eq!(rewinder.stats().chunks, 3);
    }

    #[test]
    fn test_pump_and_finish_ends_after_burst() {
        let buffer = buffer_with(10);
        let mut rewinder = Rewinder::new(Arc::clone(&buffer), ListenOptions::download(4.0));
        rewinder.pump().unwrap();

        buffer.push(Chunk::new(10_000, 1000.0, vec![10u8; 10])).unwrap();

        let mut seconds = 0.0;
        loop {
            match rewinder.read(1) {
                ReadOutcome::Data(_) => seconds += 1.0,
                ReadOutcome::Idle => panic!("one-shot listener must not idle"),
                ReadOutcome::Finished => break,
            }
        }
        assert_eq!(seconds, 4.0);
        assert_eq!(rewinder.stats().seconds, 4.0);
    }

    #[test]
    fn test_destroy_detaches_and_drains() {
        let buffer = buffer_with(5);
        let mut rewinder = Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(2.0));
        rewinder.pump().unwrap();
        assert_eq!(buffer.listener_count(), 1);

        rewinder.destroy();
        assert_eq!(buffer.listener_count(), 0);
        assert_eq!(rewinder.queued_bytes(), 0);
        assert_eq!(rewinder.read(1024), ReadOutcome::Finished);

        buffer.push(Chunk::new(5000, 1000.0, vec![5u8; 10])).unwrap();
        assert_eq!(rewinder.read(1024), ReadOutcome::Finished);
    }

    #[test]
    fn test_interval_stats_reset_between_reports() {
        let buffer = buffer_with(5);
        let mut rewinder = Rewinder::new(buffer, ListenOptions::live().with_burst(2.0));
        rewinder.pump().unwrap();
        rewinder.read(1024);

        assert_eq!(rewinder.take_interval_stats().bytes, 20);
        assert_eq!(rewinder.take_interval_stats().bytes, 0);
        assert_eq!(rewinder.stats().bytes, 20);
    }

    #[tokio::test]
    async fn test_stream_waits_for_live_push() {
        let buffer = buffer_with(3);
        let mut rewinder =
            Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(0.0)).with_read_size(1);

        let pusher = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                buffer.push(Chunk::new(3000, 1000.0, vec![3u8; 10])).unwrap();
            })
        };

        let next = tokio::time::timeout(std::time::Duration::from_secs(2), rewinder.next())
            .await
            .expect("stream should wake on push")
            .unwrap()
            .unwrap();
        assert_eq!(next.as_ref(), &[3u8; 10]);
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ends_when_buffer_destroyed() {
        let buffer = buffer_with(3);
        let mut rewinder = Rewinder::new(Arc::clone(&buffer), ListenOptions::live().with_burst(0.0));
        rewinder.pump().unwrap();

        buffer.destroy();
        assert!(rewinder.next().await.is_none());
    }
}
