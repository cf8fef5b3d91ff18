//! CLI command implementations

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use backwash_core::config::BackwashConfig;
use backwash_core::rewind::wire::decode_all;
use backwash_core::rewind::{Chunk, LoaderFrame, RewindHeader};
use backwash_core::{BackwashError, Result};
use backwash_web::{ServerOptions, run_server};
use clap::Subcommand;
use tokio::fs;
use tracing::info;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Port to bind to
        #[arg(short, long, default_value = "8090")]
        port: u16,
        /// Stream to create at startup (repeatable)
        #[arg(short, long = "stream")]
        streams: Vec<String>,
        /// Feed startup streams from a synthetic source
        #[arg(long)]
        demo: bool,
        /// Master relay to warm-start streams from
        #[arg(long)]
        master: Option<String>,
        /// Seconds of audio kept per stream
        #[arg(long)]
        buffer_seconds: Option<f64>,
    },
    /// Decode a saved rewind dump and print its contents
    Inspect {
        /// Path to the dump file
        file: PathBuf,
        /// Print one line per chunk
        #[arg(long)]
        chunks: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            streams,
            demo,
            master,
            buffer_seconds,
        } => {
            let mut config = BackwashConfig::from_env();
            if master.is_some() {
                config.replication.master_url = master;
            }
            if let Some(seconds) = buffer_seconds {
                config.rewind.buffer_seconds = seconds;
            }
            validate_config(&config)?;

            let options = ServerOptions {
                host,
                port,
                streams,
                demo,
            };
            run_server(config, options).await.context("relay server failed")
        }
        Commands::Inspect { file, chunks } => {
            let report = inspect_file(&file).await?;
            print!("{}", report.render(chunks));
            Ok(())
        }
    }
}

/// Rejects settings the relay cannot run with.
///
/// # Errors
/// - `BackwashError::Configuration` - Buffer window is not a positive number of seconds
pub fn validate_config(config: &BackwashConfig) -> Result<()> {
    let seconds = config.rewind.buffer_seconds;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(BackwashError::Configuration {
            reason: format!("buffer seconds must be positive, got {seconds}"),
        });
    }
    Ok(())
}

/// Decoded contents of a dump file.
#[derive(Debug)]
pub struct InspectReport {
    pub header: RewindHeader,
    /// Oldest first.
    pub chunks: Vec<Chunk>,
}

impl InspectReport {
    /// Builds a report from decoded frames, restoring chronological order.
    ///
    /// # Errors
    /// - `BackwashError::Configuration` - Frames carry no header
    pub fn from_frames(frames: Vec<LoaderFrame>) -> Result<Self> {
        let mut header = None;
        let mut chunks = Vec::new();
        for frame in frames {
            match frame {
                LoaderFrame::Header(h) => header = Some(h),
                LoaderFrame::Chunk(chunk) => chunks.push(chunk),
            }
        }
        let header = header.ok_or_else(|| BackwashError::Configuration {
            reason: "dump has no header".to_string(),
        })?;
        chunks.reverse();
        Ok(Self { header, chunks })
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn span_seconds(&self) -> f64 {
        self.chunks.iter().map(|c| c.duration).sum::<f64>() / 1000.0
    }

    pub fn render(&self, per_chunk: bool) -> String {
        let vitals = &self.header.vitals;
        let mut out = format!(
            "stream key:     {}\nchunk duration: {}s\ncontent type:   {}\nspan:           {:?} .. {:?}\nchunks:         {} ({:.1}s, {} bytes)\n",
            vitals.stream_key,
            vitals.chunk_duration,
            vitals.content_type.as_deref().unwrap_or("-"),
            self.header.start_ts,
            self.header.end_ts,
            self.chunks.len(),
            self.span_seconds(),
            self.total_bytes()
        );
        if per_chunk {
            for chunk in &self.chunks {
                let title = chunk
                    .meta
                    .as_ref()
                    .and_then(|m| m.title.as_deref())
                    .unwrap_or("");
                out.push_str(&format!(
                    "{:>15} {:>8.1}ms {:>7}B {}\n",
                    chunk.ts,
                    chunk.duration,
                    chunk.len(),
                    title
                ));
            }
        }
        out
    }
}

/// Reads and decodes a dump file.
///
/// # Errors
/// - `BackwashError::Io` - File cannot be read
/// - `BackwashError::Wire` - File is not a complete dump
pub async fn inspect_file(path: &Path) -> Result<InspectReport> {
    let data = fs::read(path).await?;
    info!("Inspecting {} ({} bytes)", path.display(), data.len());
    InspectReport::from_frames(decode_all(&data)?)
}

#[cfg(test)]
mod tests {
    use backwash_core::rewind::{ChunkMeta, RewindWriter, Vitals};
    use tempfile::tempdir;

    use super::*;

    fn dump_bytes(count: i64) -> Vec<u8> {
        let chunks: Vec<Chunk> = (0..count)
            .map(|i| {
                let chunk = Chunk::new(i * 500, 500.0, vec![0u8; 40]);
                if i == 0 {
                    chunk.with_meta(ChunkMeta::titled("Opener"))
                } else {
                    chunk
                }
            })
            .collect();
        let mut writer = RewindWriter::new(Vitals::new("aac-48", 0.5), chunks);
        let mut out = Vec::new();
        while let Some(part) = writer.read(256).unwrap() {
            out.extend_from_slice(&part);
        }
        out
    }

    #[tokio::test]
    async fn test_inspect_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rock.rewind");
        fs::write(&path, dump_bytes(4)).await.unwrap();

        let report = inspect_file(&path).await.unwrap();
        assert_eq!(report.chunks.len(), 4);
        assert_eq!(report.chunks[0].ts, 0);
        assert_eq!(report.total_bytes(), 160);
        assert_eq!(report.span_seconds(), 2.0);

        let rendered = report.render(true);
        assert!(rendered.contains("aac-48"));
        assert!(rendered.contains("Opener"));
        assert_eq!(rendered.lines().count(), 5 + 4);
    }

    #[tokio::test]
    async fn test_inspect_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.rewind");
        let mut data = dump_bytes(3);
        data.truncate(data.len() - 5);
        fs::write(&path, data).await.unwrap();

        let err = inspect_file(&path).await.unwrap_err();
        assert!(matches!(err, BackwashError::Wire(_)));
    }

    #[tokio::test]
    async fn test_inspect_missing_file() {
        let err = inspect_file(Path::new("/nonexistent/backwash.rewind"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackwashError::Io(_)));
    }

    #[test]
    fn test_validate_config() {
        let mut config = BackwashConfig::default();
        assert!(validate_config(&config).is_ok());
        config.rewind.buffer_seconds = 0.0;
        assert!(validate_config(&config).unwrap_err().is_user_error());
    }
}
