use std::panic;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use boardhub::config::Config;
use boardhub::db::{MemStore, PgStore, RoomStore};
use boardhub::routes::build_router;
use boardhub::ws::{hub::spawn_stats_emitter, Hub, HubConfig};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "boardhub=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Initialize the repository
    let store: Arc<dyn RoomStore> = match &config.store_url {
        Some(store_url) => {
            let store = match PgStore::connect(store_url).await {
                Ok(store) => store,
                Err(e) => {
                    error!("Failed to connect to the store: {}", e);
                    return;
                }
            };
            if let Err(e) = store.migrate().await {
                error!("Failed to prepare the store schema: {}", e);
                return;
            }
            Arc::new(store)
        }
        None => {
            warn!("No store_url configured - running on the in-memory store");
            Arc::new(MemStore::new())
        }
    };

    let hub = Hub::new(HubConfig::from(&config), store);
    let stats_task = spawn_stats_emitter(hub.clone());

    let app = build_router(hub.clone(), config.cors_origin.as_deref());

    let listener = match tokio::net::TcpListener::bind(config.server_address()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.server_address(), e);
            return;
        }
    };

    info!("Server running on http://{}", config.server_address());
    info!("WebSocket available at ws://{}/ws", config.server_address());
    info!("Swagger UI available at http://{}/swagger", config.server_address());

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    hub.shutdown().await;
    stats_task.abort();
    info!("Server exited");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
