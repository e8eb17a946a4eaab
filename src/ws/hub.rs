use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{with_backoff, RoomStore};
use crate::models::StatsResponse;
use crate::ws::cache::{CacheConfig, DocCache};
use crate::ws::registry::{CloseReason, Registry};
use crate::ws::session;

/// Hub tunables, lifted out of [`Config`] so tests can dial them directly.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub outbound_queue: usize,
    pub apply_queue: usize,
    pub max_frame_bytes: usize,
    pub snapshot_interval: Duration,
    pub snapshot_keep: u32,
    pub idle_destroy_grace: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub shutdown_drain: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            apply_queue: 1024,
            max_frame_bytes: 1024 * 1024,
            snapshot_interval: Duration::from_secs(30),
            snapshot_keep: 10,
            idle_destroy_grace: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            shutdown_drain: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            outbound_queue: config.outbound_queue,
            apply_queue: config.apply_queue,
            max_frame_bytes: config.max_frame_bytes,
            snapshot_interval: Duration::from_secs(config.snapshot_interval),
            snapshot_keep: config.snapshot_keep,
            idle_destroy_grace: Duration::from_secs(config.idle_destroy_grace),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval),
            idle_timeout: Duration::from_secs(config.idle_timeout),
            shutdown_drain: Duration::from_secs(config.shutdown_drain),
        }
    }
}

/// Composition root: owns the repository, the registry, and the document
/// cache, accepts sockets, and coordinates graceful shutdown.
pub struct Hub {
    cfg: HubConfig,
    store: Arc<dyn RoomStore>,
    registry: Arc<Registry>,
    cache: Arc<DocCache>,
    started_at: Instant,
    accepting: AtomicBool,
    live_sessions: AtomicUsize,
    total_connections: AtomicU64,
    drained: Notify,
}

impl Hub {
    pub fn new(cfg: HubConfig, store: Arc<dyn RoomStore>) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let cache = DocCache::new(
            CacheConfig {
                snapshot_interval: cfg.snapshot_interval,
                snapshot_keep: cfg.snapshot_keep,
                idle_destroy_grace: cfg.idle_destroy_grace,
                apply_queue: cfg.apply_queue,
            },
            store.clone(),
            registry.clone(),
        );
        Arc::new(Self {
            cfg,
            store,
            registry,
            cache,
            started_at: Instant::now(),
            accepting: AtomicBool::new(true),
            live_sessions: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            drained: Notify::new(),
        })
    }

    pub fn cfg(&self) -> &HubConfig {
        &self.cfg
    }

    pub fn store(&self) -> Arc<dyn RoomStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DocCache> {
        &self.cache
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.live_sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn session_finished(&self) {
        if self.live_sessions.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub async fn stats(&self) -> StatsResponse {
        StatsResponse {
            active_sessions: self.registry.session_count().await,
            active_rooms: self.registry.room_count().await,
            live_documents: self.cache.live_documents().await,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            frames_relayed: self.registry.frames_relayed(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Graceful shutdown: refuse new sockets, ask every session to close,
    /// wait out the drain deadline, force the stragglers, flush every dirty
    /// document, and close any participant row still open.
    pub async fn shutdown(&self) {
        info!("hub shutting down");
        self.accepting.store(false, Ordering::Release);
        self.registry.kick_all(CloseReason::Shutdown).await;

        let deadline = tokio::time::Instant::now() + self.cfg.shutdown_drain;
        while self.live_sessions.load(Ordering::Acquire) > 0 {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let _ = tokio::time::timeout(deadline - now, self.drained.notified()).await;
        }

        let leftover = self.registry.drain().await;
        if !leftover.is_empty() {
            warn!("{} sessions force-closed at shutdown", leftover.len());
        }

        self.cache.shutdown().await;

        let store = self.store.clone();
        match with_backoff("close_stale_participants", || {
            let store = store.clone();
            async move { store.close_stale_participants(Utc::now()).await }
        })
        .await
        {
            Ok(0) => {}
            Ok(n) => info!("closed {} dangling participant rows", n),
            Err(e) => error!("failed to close participant rows: {}", e),
        }
        info!("hub shutdown complete");
    }
}

/// WebSocket endpoint at /ws.
pub async fn ws_endpoint(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    if !hub.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.on_upgrade(move |socket| session::run_session(socket, hub))
}

/// Periodic stats line, the hub's own heartbeat in the logs.
pub fn spawn_stats_emitter(hub: Arc<Hub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.tick().await;
        loop {
            tick.tick().await;
            let stats = hub.stats().await;
            info!(
                "stats: sessions={} rooms={} documents={} connections={} relayed={}",
                stats.active_sessions,
                stats.active_rooms,
                stats.live_documents,
                stats.total_connections,
                stats.frames_relayed
            );
        }
    })
}
