//! NATS producer and topic consumer

use crate::clients::config::NatsConfig;
use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::item::{Metadata, OutboundItem, RecordedEvent};
use crate::delivery::traits::Downstream;
use crate::replay::handler::EventHandler;
use crate::replay::topics::TopicSource;
use async_nats::connection::State;
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// NATS core producer.
///
/// The connection is opened on first use so a broker that is down at
/// startup is handled by the probe loop like any other outage.
pub struct NatsProducer {
    client: OnceCell<Client>,
    config: NatsConfig,
}

impl NatsProducer {
    pub fn new(config: NatsConfig) -> DeliveryResult<Self> {
        if config.servers.is_empty() {
            return Err(DeliveryError::Fatal("No NATS servers configured".to_string()));
        }

        Ok(Self {
            client: OnceCell::new(),
            config,
        })
    }

    async fn client(&self) -> DeliveryResult<&Client> {
        self.client
            .get_or_try_init(|| async {
                let client = ConnectOptions::new()
                    .name(&self.config.connection_name)
                    .request_timeout(Some(self.config.request_timeout()))
                    .connect(self.config.servers.join(","))
                    .await
                    .map_err(|e| DeliveryError::Unavailable(format!("NATS connection failed: {}", e)))?;

                info!(servers = ?self.config.servers, "Connected to NATS");
                Ok(client)
            })
            .await
    }

    async fn connected_client(&self) -> DeliveryResult<&Client> {
        let client = self.client().await?;

        match client.connection_state() {
            State::Connected => Ok(client),
            state => Err(DeliveryError::Unavailable(format!("NATS connection is {:?}", state))),
        }
    }
}

#[async_trait]
impl Downstream for NatsProducer {
    fn name(&self) -> &str {
        "nats"
    }

    async fn publish(&self, item: &OutboundItem) -> DeliveryResult<()> {
        let client = self.connected_client().await?;
        let payload = item.payload.clone().into();

        let published = if item.metadata.is_empty() {
            client.publish(item.destination.clone(), payload).await
        } else {
            let mut headers = HeaderMap::new();
            for (key, value) in &item.metadata {
                headers.insert(key.as_str(), value.as_str());
            }
            client
                .publish_with_headers(item.destination.clone(), headers, payload)
                .await
        };

        published.map_err(|e| DeliveryError::Unavailable(format!("NATS publish failed: {}", e)))?;

        client
            .flush()
            .await
            .map_err(|e| DeliveryError::Unavailable(format!("NATS flush failed: {}", e)))?;

        debug!(subject = %item.destination, size = item.size(), "Published to NATS");
        Ok(())
    }

    async fn probe(&self) -> DeliveryResult<()> {
        self.connected_client().await.map(|_| ())
    }

    async fn create_destination(&self, _destination: &str) -> DeliveryResult<()> {
        // Subjects exist implicitly
        Ok(())
    }
}

/// Topics map to subjects, channels to queue groups so instances sharing a
/// channel split the messages between them
#[async_trait]
impl TopicSource for NatsProducer {
    fn name(&self) -> &str {
        "nats"
    }

    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        handler: &dyn EventHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> DeliveryResult<()> {
        let client = self.connected_client().await?;
        let mut subscriber = client
            .queue_subscribe(topic.to_string(), channel.to_string())
            .await
            .map_err(|e| DeliveryError::Unavailable(format!("NATS subscribe failed: {}", e)))?;

        info!(subject = %topic, queue_group = %channel, "Subscribed to NATS subject");

        let mut sequence = 0;
        loop {
            tokio::select! {
                message = subscriber.next() => {
                    let Some(message) = message else {
                        return Err(DeliveryError::Unavailable(format!("NATS subscription to {} closed", topic)));
                    };

                    let mut metadata = Metadata::new();
                    metadata.insert("channel".to_string(), channel.to_string());

                    let event = RecordedEvent {
                        stream: topic.to_string(),
                        version: sequence,
                        event_type: message.subject.to_string(),
                        payload: message.payload.to_vec(),
                        metadata,
                    };
                    sequence += 1;

                    if let Err(e) = handler.handle(&event).await {
                        warn!(subject = %topic, error = %e, "Message handler failed");
                    }
                }
                // Dropping the subscriber unsubscribes
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_servers() {
        let config = NatsConfig {
            servers: Vec::new(),
            ..Default::default()
        };
        assert!(NatsProducer::new(config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let producer = NatsProducer::new(NatsConfig {
            servers: vec!["nats://127.0.0.1:1".to_string()],
            request_timeout_ms: 200,
            ..Default::default()
        })
        .unwrap();

        let err = producer.probe().await.unwrap_err();
        assert!(err.is_transient());
    }
}
