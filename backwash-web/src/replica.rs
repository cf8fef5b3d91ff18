//! Replica warm start
//!
//! A relay started with a master URL pulls each stream's rewind dump from
//! the master before accepting listeners, so rewound listeners on the
//! replica have history from the first second.

use backwash_core::config::ReplicationConfig;
use backwash_core::rewind::{PreloadSummary, RewindBuffer};
use futures::future::join_all;
use tracing::{info, warn};

use crate::WebError;
use crate::server::StreamRegistry;

/// URL of the named stream's dump on the master.
pub fn rewind_url(master_url: &str, stream: &str) -> String {
    format!("{}/streams/{}/rewind", master_url.trim_end_matches('/'), stream)
}

pub fn build_client(config: &ReplicationConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
}

/// Preloads `buffer` from the master's dump of the same stream.
///
/// # Errors
///
/// - `WebError::Master` - Master unreachable
/// - `WebError::MasterStatus` - Master has no dump for this stream
pub async fn warm_start(
    client: &reqwest::Client,
    master_url: &str,
    buffer: &RewindBuffer,
) -> Result<PreloadSummary, WebError> {
    let url = rewind_url(master_url, buffer.name());
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|source| WebError::Master {
            url: url.clone(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(WebError::MasterStatus {
            url,
            status: response.status().as_u16(),
        });
    }

    Ok(buffer.preload(Box::pin(response.bytes_stream())).await)
}

/// Warm-starts every registered stream concurrently. Failures are logged and
/// leave that stream empty.
pub async fn warm_start_all(streams: &StreamRegistry, master_url: &str, config: &ReplicationConfig) {
    let client = match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot build replication client: {}", e);
            return;
        }
    };

    let buffers = streams.all().await;
    let results = join_all(
        buffers
            .iter()
            .map(|buffer| warm_start(&client, master_url, buffer)),
    )
    .await;

    for (buffer, result) in buffers.iter().zip(results) {
        match result {
            Ok(summary) => info!(
                "{}: warm start loaded {} chunks from {}{}",
                buffer.name(),
                summary.chunks_loaded,
                master_url,
                if summary.is_complete() { "" } else { " (incomplete)" }
            ),
            Err(e) => warn!("{}: warm start failed: {}", buffer.name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use backwash_core::config::{BackwashConfig, RewindConfig};
    use backwash_core::rewind::{Chunk, Vitals};

    use super::*;
    use crate::server::{AppState, build_router};

    #[test]
    fn test_rewind_url() {
        assert_eq!(
            rewind_url("http://master:8090/", "rock"),
            "http://master:8090/streams/rock/rewind"
        );
    }

    #[tokio::test]
    async fn test_warm_start_from_running_master() {
        let master = AppState::new(BackwashConfig::for_testing());
        let source = master.streams.get_or_create("rock").await;
        source.update_vitals(Vitals::new("mp3-128", 1.0)).unwrap();
        for i in 0..6 {
            source
                .push(Chunk::new(i * 1000, 1000.0, vec![i as u8; 32]))
                .unwrap();
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, build_router(master)).await.unwrap();
        });

        let config = ReplicationConfig {
            master_url: None,
            connect_timeout: Duration::from_secs(2),
        };
        let client = build_client(&config).unwrap();
        let replica = RewindBuffer::new("rock", &RewindConfig::default());
        let summary = warm_start(&client, &format!("http://{addr}"), &replica)
            .await
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.chunks_loaded, 6);
        assert_eq!(replica.status().last_ts, Some(5000));

        let missing = RewindBuffer::new("jazz", &RewindConfig::default());
        let err = warm_start(&client, &format!("http://{addr}"), &missing)
            .await
            .unwrap_err();
        assert!(matches!(err, WebError::MasterStatus { status: 404, .. }));

        server.abort();
    }
}
