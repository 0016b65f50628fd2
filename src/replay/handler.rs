//! Handlers that receive replayed events

use crate::clients::{classify_request_error, classify_status};
use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::item::RecordedEvent;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Consumer of replayed events.
///
/// Errors are logged by the reader and the event is not retried.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &RecordedEvent) -> DeliveryResult<()>;
}

/// Adapter returned by [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(RecordedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = DeliveryResult<()>> + Send,
{
    async fn handle(&self, event: &RecordedEvent) -> DeliveryResult<()> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RecordedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = DeliveryResult<()>> + Send,
{
    FnHandler { f }
}

/// Forwards replayed payloads to the service's own HTTP router so the
/// regular request handlers rebuild local state.
#[derive(Clone)]
pub struct HttpForwardHandler {
    client: Client,
    base_url: String,
    prefix: String,
}

impl HttpForwardHandler {
    pub fn new(base_url: impl Into<String>, prefix: impl Into<String>, timeout: Duration) -> DeliveryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Fatal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            prefix: prefix.into(),
        })
    }

    /// Target URL for events of `stream`
    pub fn url_for(&self, stream: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", self.base_url, stream)
        } else {
            format!("{}/{}/{}", self.base_url, prefix, stream)
        }
    }
}

#[async_trait]
impl EventHandler for HttpForwardHandler {
    async fn handle(&self, event: &RecordedEvent) -> DeliveryResult<()> {
        let url = self.url_for(&event.stream);

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(event.payload.clone())
            .send()
            .await
            .map_err(|e| classify_request_error(e, &url))?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!(stream = %event.stream, version = event.version, url = %url, "Event forwarded");
            return Ok(());
        }

        info!(
            stream = %event.stream,
            version = event.version,
            status = status.as_u16(),
            "Event received by the router with a non-200 status"
        );

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(payload: &str) -> RecordedEvent {
        RecordedEvent {
            stream: "user".to_string(),
            version: 1,
            event_type: "user.created".to_string(),
            payload: payload.as_bytes().to_vec(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |event: RecordedEvent| {
            let counter = counter.clone();
            async move {
                assert_eq!(event.stream, "user");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler.handle(&event("{\"id\":1}")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forward_url() {
        let handler = HttpForwardHandler::new("http://127.0.0.1:8080/", "/es/", Duration::from_secs(1)).unwrap();
        assert_eq!(handler.url_for("user"), "http://127.0.0.1:8080/es/user");

        let handler = HttpForwardHandler::new("http://127.0.0.1:8080", "", Duration::from_secs(1)).unwrap();
        assert_eq!(handler.url_for("user"), "http://127.0.0.1:8080/user");
    }

    #[tokio::test]
    async fn test_forward_posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/es/user")
            .match_header("content-type", "application/json")
            .match_body("{\"id\":1}")
            .with_status(200)
            .create_async()
            .await;

        let handler = HttpForwardHandler::new(server.url(), "/es/", Duration::from_secs(5)).unwrap();
        handler.handle(&event("{\"id\":1}")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_forward_tolerates_client_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/es/user")
            .with_status(400)
            .create_async()
            .await;

        let handler = HttpForwardHandler::new(server.url(), "/es/", Duration::from_secs(5)).unwrap();
        assert!(handler.handle(&event("{}")).await.is_ok());
    }
}
