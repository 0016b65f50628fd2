//! Topic capture: messages other services publish to the broker are handed
//! to local handlers, the broker counterpart of stream replay.
//!
//! Unlike streams there is no history to catch up on, so topic capture never
//! holds the replay gate.

use crate::delivery::counters::DeliveryCounters;
use crate::delivery::error::DeliveryResult;
use crate::delivery::item::RecordedEvent;
use crate::delivery::traits::Downstream;
use crate::replay::handler::EventHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broker side of topic capture
#[async_trait]
pub trait TopicSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Subscribe to `topic` as `channel` and hand every message to `handler`.
    ///
    /// Returns `Ok(())` once shutdown was signalled, and an error when the
    /// subscription could not be set up or was lost.
    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        handler: &dyn EventHandler,
        shutdown: watch::Receiver<bool>,
    ) -> DeliveryResult<()>;
}

/// One subscribed topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicListener {
    pub topic: String,
    pub channel: String,
}

/// Counts every received message, then hands it on. Handler failures are
/// logged and the message is still acknowledged.
struct CountingHandler {
    inner: Arc<dyn EventHandler>,
    counters: Arc<DeliveryCounters>,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, event: &RecordedEvent) -> DeliveryResult<()> {
        self.counters.record_received();

        if let Err(e) = self.inner.handle(event).await {
            warn!(topic = %event.stream, error = %e, "Message handler failed");
        }
        Ok(())
    }
}

struct Subscription {
    listener: TopicListener,
    handler: Arc<dyn EventHandler>,
}

/// Registers topic listeners and spawns one consumer task per listener
pub struct TopicReader {
    source: Arc<dyn TopicSource>,
    producer: Arc<dyn Downstream>,
    counters: Arc<DeliveryCounters>,
    backoff: Duration,
    subscriptions: Vec<Subscription>,
}

impl TopicReader {
    /// `producer` creates missing topics before subscribing, `counters` gets
    /// one `recv_total` per message.
    pub fn new(
        source: Arc<dyn TopicSource>,
        producer: Arc<dyn Downstream>,
        counters: Arc<DeliveryCounters>,
        backoff: Duration,
    ) -> Self {
        Self {
            source,
            producer,
            counters,
            backoff,
            subscriptions: Vec::new(),
        }
    }

    pub fn capture(
        &mut self,
        topic: impl Into<String>,
        channel: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.subscriptions.push(Subscription {
            listener: TopicListener {
                topic: topic.into(),
                channel: channel.into(),
            },
            handler,
        });
        self
    }

    pub fn listeners(&self) -> Vec<&TopicListener> {
        self.subscriptions.iter().map(|s| &s.listener).collect()
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if !self.subscriptions.is_empty() {
            info!(
                broker = %self.source.name(),
                topics = self.subscriptions.len(),
                "Starting topic capture"
            );
        }

        self.subscriptions
            .into_iter()
            .map(|subscription| {
                let task = TopicTask {
                    source: self.source.clone(),
                    producer: self.producer.clone(),
                    handler: CountingHandler {
                        inner: subscription.handler,
                        counters: self.counters.clone(),
                    },
                    listener: subscription.listener,
                    backoff: self.backoff,
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect()
    }
}

struct TopicTask {
    source: Arc<dyn TopicSource>,
    producer: Arc<dyn Downstream>,
    handler: CountingHandler,
    listener: TopicListener,
    backoff: Duration,
    shutdown: watch::Receiver<bool>,
}

impl TopicTask {
    async fn run(mut self) {
        let TopicListener { topic, channel } = self.listener.clone();

        while !*self.shutdown.borrow() {
            // Subscribing to a topic nobody published to yet must not fail
            if let Err(e) = self.producer.create_destination(&topic).await {
                warn!(topic = %topic, error = %e, "Cannot create topic before subscribing");
            }

            debug!(topic = %topic, channel = %channel, "Subscribing to topic");
            let consumed = self
                .source
                .consume(&topic, &channel, &self.handler, self.shutdown.clone())
                .await;

            match consumed {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        topic = %topic,
                        channel = %channel,
                        error = %e,
                        "Topic subscription lost, resubscribing in {:?}",
                        self.backoff
                    );
                    if self.pause().await {
                        break;
                    }
                }
            }
        }

        debug!(topic = %topic, channel = %channel, "Topic capture stopped");
    }

    /// Sleep unless shutdown comes first; true means shut down
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::InMemoryBroker;
    use crate::delivery::item::OutboundItem;
    use crate::replay::handler::handler_fn;
    use parking_lot::Mutex;

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_failing_handler_still_counts_message() {
        let broker = Arc::new(InMemoryBroker::new("nsq"));
        let counters = Arc::new(DeliveryCounters::new());
        let failing = handler_fn(|_event| async {
            Err(crate::delivery::error::DeliveryError::Handler("boom".to_string()))
        });

        let mut reader = TopicReader::new(broker.clone(), broker.clone(), counters.clone(), Duration::from_millis(10));
        reader.capture("mail", "kitsvc", Arc::new(failing));

        let (tx, rx) = watch::channel(false);
        let tasks = reader.start(rx);
        assert!(wait_for(|| broker.subscriber_count("mail") == 1).await);

        broker.publish(&OutboundItem::new("mail", b"1".to_vec())).await.unwrap();
        broker.publish(&OutboundItem::new("mail", b"2".to_vec())).await.unwrap();

        assert!(wait_for(|| counters.recv_total() == 2).await);

        tx.send(true).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_resubscribes_after_broker_outage() {
        let broker = Arc::new(InMemoryBroker::new("nsq"));
        broker.set_reachable(false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |event: RecordedEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().push(event.payload);
                Ok(())
            }
        });

        let mut reader = TopicReader::new(
            broker.clone(),
            broker.clone(),
            Arc::new(DeliveryCounters::new()),
            Duration::from_millis(10),
        );
        reader.capture("mail", "kitsvc", Arc::new(handler));

        let (tx, rx) = watch::channel(false);
        let tasks = reader.start(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.subscriber_count("mail"), 0);

        broker.set_reachable(true);
        assert!(wait_for(|| broker.subscriber_count("mail") == 1).await);
        broker.publish(&OutboundItem::new("mail", b"hello".to_vec())).await.unwrap();

        assert!(wait_for(|| seen.lock().len() == 1).await);
        assert_eq!(seen.lock()[0], b"hello".to_vec());

        tx.send(true).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
