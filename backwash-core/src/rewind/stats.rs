//! Status and accounting snapshots for buffers and listeners

use serde::Serialize;
use uuid::Uuid;

use super::chunk::Vitals;
use super::store::StoreCounters;

/// Point-in-time view of a rewind buffer for monitoring.
///
/// A stalled source shows up as a `last_ts` that stops advancing; a desynced
/// replica as `first_ts`/`last_ts` drifting from its master's.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub stream: String,
    pub buffered_chunks: usize,
    pub max_chunks: usize,
    pub buffered_seconds: f64,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
    pub vitals: Option<Vitals>,
    pub listeners: usize,
    pub loading: bool,
    pub counters: StoreCounters,
}

impl BufferStatus {
    /// Fraction of the configured rewind window currently filled (0-1).
    pub fn fill_ratio(&self) -> f64 {
        if self.max_chunks == 0 || self.max_chunks == usize::MAX {
            return 0.0;
        }
        self.buffered_chunks as f64 / self.max_chunks as f64
    }

    /// One-line summary for logs.
    pub fn format_summary(&self) -> String {
        format!(
            "{}: {}/{} chunks ({:.1}s, {:.0}% full), {} listeners{}",
            self.stream,
            self.buffered_chunks,
            self.max_chunks,
            self.buffered_seconds,
            self.fill_ratio() * 100.0,
            self.listeners,
            if self.loading { ", preloading" } else { "" }
        )
    }
}

/// Running totals of audio delivered to one listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ListenStats {
    pub bytes: u64,
    pub seconds: f64,
    pub chunks: u64,
}

impl ListenStats {
    pub(crate) fn record(&mut self, bytes: usize, duration_ms: f64) {
        self.bytes += bytes as u64;
        self.seconds += duration_ms / 1000.0;
        self.chunks += 1;
    }

    /// Average delivery bitrate in kbit/s, zero before any audio was sent.
    pub fn kbps(&self) -> f64 {
        if self.seconds <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0 / 1000.0) / self.seconds
    }
}

/// Per-listener accounting collected by periodic housekeeping.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerReport {
    pub id: Uuid,
    /// Chunks behind live this listener is held at.
    pub offset: usize,
    pub queued_bytes: usize,
    /// Delivered since the previous report.
    pub interval: ListenStats,
    pub total: ListenStats,
}
