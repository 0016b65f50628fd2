use crate::clients::config::{EventStoreConfig, MessageQueueConfig};
use crate::delivery::config::DeliveryConfig;
use crate::discovery::DiscoveryConfig;
use crate::error::{AppError, Result};
use crate::replay::config::ReplayConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Event log connection
    #[serde(default)]
    pub event_store: EventStoreConfig,

    /// Message broker connection
    #[serde(default)]
    pub message_queue: MessageQueueConfig,

    /// Outbound queue and retry flusher
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Startup replay
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Service registry
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from `CONFIG_PATH` (or `config/default.toml`) and
    /// the environment
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load configuration layered as: embedded defaults, optional file at
    /// `path`, then `KITSVC__SECTION__KEY` environment variables
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("KITSVC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("replay.streams")
                    .with_list_parse_key("discovery.tags")
                    .with_list_parse_key("message_queue.nats.servers"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;
        self.delivery.validate()?;
        self.replay.validate()?;
        self.message_queue.validate()?;
        self.discovery.validate()?;

        if self.observability.metrics_interval_ms == 0 {
            return Err(AppError::Configuration(
                "observability.metrics_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.http_port)
            .parse()
            .map_err(|e| AppError::Configuration(format!("Invalid server address: {}", e)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// How often delivery counters are sampled into metrics (milliseconds)
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
}

impl ObservabilityConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            metrics_interval_ms: default_metrics_interval_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "kitsvc_delivery=info,tower_http=info".to_string()
}

fn default_metrics_interval_ms() -> u64 {
    1000
}
