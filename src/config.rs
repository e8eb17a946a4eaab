use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP/WebSocket port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Repository connection string (Postgres). When unset the hub runs on
    /// the in-memory store and nothing survives a restart.
    pub store_url: Option<String>,

    /// Allowed origin for the REST surface
    pub cors_origin: Option<String>,

    /// Periodic snapshot save period, seconds
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Retained snapshots per room
    #[serde(default = "default_snapshot_keep")]
    pub snapshot_keep: u32,

    /// Empty-room grace before the document is destroyed, seconds
    #[serde(default = "default_idle_destroy_grace")]
    pub idle_destroy_grace: u64,

    /// Per-session outbound queue size, frames
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Per-room apply mailbox cap
    #[serde(default = "default_apply_queue")]
    pub apply_queue: usize,

    /// Inbound frame cap, bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Server-side keepalive ping cadence, seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Idle read timeout, seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Shutdown drain deadline, seconds
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.listen_port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            listen_port: default_listen_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            store_url: None,
            cors_origin: None,
            snapshot_interval: default_snapshot_interval(),
            snapshot_keep: default_snapshot_keep(),
            idle_destroy_grace: default_idle_destroy_grace(),
            outbound_queue: default_outbound_queue(),
            apply_queue: default_apply_queue(),
            max_frame_bytes: default_max_frame_bytes(),
            heartbeat_interval: default_heartbeat_interval(),
            idle_timeout: default_idle_timeout(),
            shutdown_drain: default_shutdown_drain(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_snapshot_keep() -> u32 {
    10
}

fn default_idle_destroy_grace() -> u64 {
    60
}

fn default_outbound_queue() -> usize {
    256
}

fn default_apply_queue() -> usize {
    1024
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_shutdown_drain() -> u64 {
    5
}
