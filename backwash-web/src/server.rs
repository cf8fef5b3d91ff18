//! Router, shared state and server lifecycle

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use backwash_core::config::{BackwashConfig, ListenerConfig, RewindConfig};
use backwash_core::rewind::RewindBuffer;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::WebError;
use crate::handlers::{dump_rewind, list_streams, listen_stream, preload_rewind, stream_status};

/// Rewind buffers keyed by stream name.
#[derive(Clone)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, Arc<RewindBuffer>>>>,
    rewind: RewindConfig,
}

impl StreamRegistry {
    pub fn new(rewind: RewindConfig) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            rewind,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<RewindBuffer>> {
        self.streams.read().await.get(name).cloned()
    }

    /// Returns the named buffer, creating an empty one if needed.
    pub async fn get_or_create(&self, name: &str) -> Arc<RewindBuffer> {
        if let Some(buffer) = self.get(name).await {
            return buffer;
        }
        let mut streams = self.streams.write().await;
        Arc::clone(streams.entry(name.to_string()).or_insert_with(|| {
            info!("Created rewind buffer for stream {}", name);
            Arc::new(RewindBuffer::new(name, &self.rewind))
        }))
    }

    /// Every buffer, sorted by stream name.
    pub async fn all(&self) -> Vec<Arc<RewindBuffer>> {
        let streams = self.streams.read().await;
        let mut buffers: Vec<_> = streams.values().cloned().collect();
        buffers.sort_by(|a, b| a.name().cmp(b.name()));
        buffers
    }

    /// Removes and destroys the named buffer, ending its listeners.
    pub async fn remove(&self, name: &str) -> bool {
        match self.streams.write().await.remove(name) {
            Some(buffer) => {
                buffer.destroy();
                true
            }
            None => false,
        }
    }

    /// Destroys every buffer.
    pub async fn shutdown(&self) {
        for (_, buffer) in self.streams.write().await.drain() {
            buffer.destroy();
        }
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub streams: StreamRegistry,
    pub config: Arc<BackwashConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: BackwashConfig) -> Self {
        Self {
            streams: StreamRegistry::new(config.rewind.clone()),
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

/// What `run_server` binds and which streams it starts with.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: IpAddr,
    pub port: u16,
    /// Streams created at startup (and warm-started from a master, if set).
    pub streams: Vec<String>,
    /// Feed every startup stream from the synthetic source.
    pub demo: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8090,
            streams: Vec::new(),
            demo: false,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/streams", get(list_streams))
        .route("/streams/{key}/status", get(stream_status))
        .route("/streams/{key}/listen", get(listen_stream))
        .route("/streams/{key}/rewind", get(dump_rewind).put(preload_rewind))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the relay until Ctrl-C.
///
/// With a master configured, startup streams are preloaded from it before
/// the listener socket opens.
///
/// # Errors
///
/// - `WebError::Bind` - Address is unavailable
/// - `WebError::Serve` - Server failed while running
pub async fn run_server(config: BackwashConfig, options: ServerOptions) -> Result<(), WebError> {
    let state = AppState::new(config);

    let mut streams = options.streams.clone();
    if options.demo && streams.is_empty() {
        streams.push("demo".to_string());
    }
    for name in &streams {
        state.streams.get_or_create(name).await;
    }

    if let Some(master) = state.config.replication.master_url.clone() {
        crate::replica::warm_start_all(&state.streams, &master, &state.config.replication).await;
    }

    let mut background = Vec::new();
    if options.demo {
        for name in &streams {
            let buffer = state.streams.get_or_create(name).await;
            background.push(crate::demo::spawn_demo_source(
                buffer,
                crate::demo::DemoSource::default(),
            ));
        }
    }
    background.push(spawn_housekeeping(
        state.streams.clone(),
        state.config.listener.clone(),
    ));

    let addr = SocketAddr::new(options.host, options.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| WebError::Bind { addr, source })?;
    info!("Backwash relay listening on http://{}", addr);

    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down");
    for task in background {
        task.abort();
    }
    state.streams.shutdown().await;
    Ok(())
}

/// Periodically logs listener accounting and disconnects listeners that
/// cannot keep up.
pub fn spawn_housekeeping(streams: StreamRegistry, config: ListenerConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.housekeeping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for buffer in streams.all().await {
                housekeep(&buffer, &config);
            }
        }
    })
}

fn housekeep(buffer: &RewindBuffer, config: &ListenerConfig) {
    for report in buffer.listener_reports() {
        debug!(
            "{}: listener {} at offset {}: {} bytes ({:.1}s) this interval, {} queued",
            buffer.name(),
            report.id,
            report.offset,
            report.interval.bytes,
            report.interval.seconds,
            report.queued_bytes
        );
    }

    let dropped = buffer.disconnect_slow_listeners(config.max_queued_bytes);
    if !dropped.is_empty() {
        warn!(
            "{}: disconnected {} slow listeners",
            buffer.name(),
            dropped.len()
        );
    }
    debug!("{}", buffer.status().format_summary());
}
