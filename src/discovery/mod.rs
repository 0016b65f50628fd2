//! Service discovery.
//!
//! The service only announces itself once the initial replay finished, and
//! withdraws on shutdown.

pub mod consul;

pub use consul::ConsulAgent;

use crate::error::{AppError, Result};
use crate::replay::ReplayGate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Registration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Consul agent HTTP address
    #[serde(default = "default_consul_url")]
    pub consul_url: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Address announced to the registry; the agent's own address when unset
    #[serde(default)]
    pub service_address: Option<String>,

    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Base URL the health check is run against
    #[serde(default = "default_service_url")]
    pub service_url: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    #[serde(default = "default_check_timeout")]
    pub check_timeout: String,

    /// Request timeout towards the agent in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.service_name.trim().is_empty() {
            return Err(AppError::Configuration(
                "discovery.service_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            consul_url: default_consul_url(),
            service_name: default_service_name(),
            service_address: None,
            service_port: default_service_port(),
            service_url: default_service_url(),
            tags: Vec::new(),
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_consul_url() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_service_name() -> String {
    "kitsvc".to_string()
}

fn default_service_port() -> u16 {
    8080
}

fn default_service_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_check_interval() -> String {
    "10s".to_string()
}

fn default_check_timeout() -> String {
    "1s".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

/// HTTP health check attached to a registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(rename = "HTTP")]
    pub http: String,
    pub interval: String,
    pub timeout: String,
}

/// Service entry as understood by the Consul agent API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub port: u16,
    pub tags: Vec<String>,
    pub check: HealthCheck,
}

impl ServiceRegistration {
    /// Build a registration with a fresh instance ID. The bare version is
    /// appended to the configured tags.
    pub fn from_config(config: &DiscoveryConfig, version: &str) -> Self {
        let mut tags = config.tags.clone();
        tags.push(version.to_string());

        Self {
            id: format!("{}-{}", config.service_name, Uuid::new_v4()),
            name: config.service_name.clone(),
            address: config.service_address.clone(),
            port: config.service_port,
            tags,
            check: HealthCheck {
                http: format!("{}/health", config.service_url.trim_end_matches('/')),
                interval: config.check_interval.clone(),
                timeout: config.check_timeout.clone(),
            },
        }
    }
}

/// A service registry the instance announces itself to
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()>;

    async fn deregister(&self, service_id: &str) -> Result<()>;
}

/// Register once the replay gate fired, deregister on shutdown.
///
/// Nothing is registered when shutdown comes first.
pub fn register_when_replayed(
    registry: Arc<dyn ServiceRegistry>,
    gate: Arc<ReplayGate>,
    registration: ServiceRegistration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = gate.wait() => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }

        if let Err(e) = registry.register(&registration).await {
            error!(service_id = %registration.id, error = %e, "Cannot register the service");
            return;
        }

        info!(
            service_id = %registration.id,
            service = %registration.name,
            "Service registered, events replayed"
        );

        let _ = shutdown.wait_for(|stop| *stop).await;

        match registry.deregister(&registration.id).await {
            Ok(()) => info!(service_id = %registration.id, "Service deregistered"),
            Err(e) => warn!(service_id = %registration.id, error = %e, "Cannot deregister the service"),
        }
    })
}
