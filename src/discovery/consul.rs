//! Consul agent registry

use crate::discovery::{ServiceRegistration, ServiceRegistry};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Registers services with the local Consul agent over its HTTP API
#[derive(Clone)]
pub struct ConsulAgent {
    client: Client,
    base_url: String,
}

impl ConsulAgent {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn put(&self, path: &str, body: Option<&ServiceRegistration>) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.put(&url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| AppError::Integration {
            integration_source: "consul".to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(AppError::Integration {
            integration_source: "consul".to_string(),
            message: format!("{} returned {}: {}", path, status.as_u16(), body.trim()),
        })
    }
}

#[async_trait]
impl ServiceRegistry for ConsulAgent {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        self.put("/v1/agent/service/register", Some(registration)).await?;
        debug!(service_id = %registration.id, "Registered with Consul");
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        self.put(&format!("/v1/agent/service/deregister/{}", service_id), None)
            .await?;
        debug!(service_id = %service_id, "Deregistered from Consul");
        Ok(())
    }
}
