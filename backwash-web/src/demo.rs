//! Synthetic audio source for trying a relay without an encoder

use std::sync::Arc;
use std::time::Duration;

use backwash_core::rewind::{Chunk, ChunkMeta, RewindBuffer, RewindError, Vitals};
use bytes::Bytes;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shape of the generated stream.
#[derive(Debug, Clone)]
pub struct DemoSource {
    pub chunk_duration: Duration,
    /// 8-bit mono PCM samples per second
    pub sample_rate: u32,
    /// Chunks per fake track before the now-playing title changes
    pub chunks_per_track: u64,
}

impl Default for DemoSource {
    fn default() -> Self {
        Self {
            chunk_duration: Duration::from_millis(500),
            sample_rate: 8000,
            chunks_per_track: 120,
        }
    }
}

impl DemoSource {
    pub fn vitals(&self) -> Vitals {
        let mut vitals = Vitals::new(
            format!("demo-pcm-u8-{}", self.sample_rate),
            self.chunk_duration.as_secs_f64(),
        );
        vitals.frames_per_second = f64::from(self.sample_rate);
        vitals.content_type = Some("audio/L8".to_string());
        vitals
    }

    /// The `index`-th chunk of a stream that started at `start_ms`.
    pub fn chunk(&self, start_ms: i64, index: u64) -> Chunk {
        let duration_ms = self.chunk_duration.as_secs_f64() * 1000.0;
        let ts = start_ms + (index as f64 * duration_ms).round() as i64;
        let samples = (f64::from(self.sample_rate) * self.chunk_duration.as_secs_f64()) as usize;

        // sawtooth whose pitch steps with each track
        let track = index / self.chunks_per_track.max(1);
        let period = 20 + (track % 8) as usize * 4;
        let data: Vec<u8> = (0..samples)
            .map(|i| ((i % period) * 255 / period) as u8)
            .collect();

        let chunk = Chunk::new(ts, duration_ms, Bytes::from(data));
        if index % self.chunks_per_track.max(1) == 0 {
            chunk.with_meta(ChunkMeta::titled(format!("Demo Track {}", track + 1)))
        } else {
            chunk
        }
    }
}

/// Feeds `buffer` in real time until the buffer is destroyed.
pub fn spawn_demo_source(buffer: Arc<RewindBuffer>, source: DemoSource) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = buffer.update_vitals(source.vitals()) {
            warn!("{}: demo source rejected: {}", buffer.name(), e);
            return;
        }
        info!(
            "{}: demo source running ({}ms chunks)",
            buffer.name(),
            source.chunk_duration.as_millis()
        );

        let start_ms = Utc::now().timestamp_millis();
        let mut interval = tokio::time::interval(source.chunk_duration);
        let mut index = 0u64;
        loop {
            interval.tick().await;
            match buffer.push(source.chunk(start_ms, index)) {
                Ok(_) => {}
                Err(RewindError::Destroyed { .. }) => {
                    debug!("{}: demo source stopped", buffer.name());
                    return;
                }
                Err(e) => warn!("{}: demo chunk rejected: {}", buffer.name(), e),
            }
            index += 1;
        }
    })
}

#[cfg(test)]
mod tests {
    use backwash_core::config::RewindConfig;

    use super::*;

    #[test]
    fn test_chunks_are_contiguous() {
        let source = DemoSource::default();
        let first = source.chunk(1_000_000, 0);
        let second = source.chunk(1_000_000, 1);
        assert_eq!(first.end_ts(), second.ts as f64);
        assert_eq!(first.len(), 4000);
        assert_eq!(first.meta, Some(ChunkMeta::titled("Demo Track 1")));
        assert!(second.meta.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_source_fills_buffer_until_destroyed() {
        let buffer = Arc::new(RewindBuffer::new("demo", &RewindConfig::default()));
        let task = spawn_demo_source(Arc::clone(&buffer), DemoSource::default());

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(buffer.status().buffered_chunks, 5);
        assert_eq!(buffer.current_meta(), Some(ChunkMeta::titled("Demo Track 1")));

        buffer.destroy();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(task.is_finished());
    }
}
