//! In-process broker and event log.
//!
//! Both support fault injection so the delivery and replay paths can be
//! exercised without external services.

use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::item::{Metadata, OutboundItem, RecordedEvent, PLACEHOLDER_PAYLOAD};
use crate::delivery::traits::{Downstream, EventLog, StreamSlice};
use crate::replay::handler::EventHandler;
use crate::replay::topics::TopicSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::warn;

#[derive(Debug)]
struct Subscriber {
    channel: String,
    sender: mpsc::UnboundedSender<OutboundItem>,
}

#[derive(Debug, Default)]
struct BrokerState {
    published: Vec<OutboundItem>,
    poisoned: HashSet<String>,
    blocked: HashSet<String>,
    missing: HashSet<String>,
    denied: HashSet<String>,
    created: Vec<String>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// Message broker held in memory
#[derive(Debug)]
pub struct InMemoryBroker {
    name: String,
    reachable: AtomicBool,
    probes: AtomicUsize,
    attempts: AtomicUsize,
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reachable: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Simulate the broker going down or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Reject every publish to `destination` outright
    pub fn poison_destination(&self, destination: &str) {
        self.state.lock().poisoned.insert(destination.to_string());
    }

    /// Report `destination` as unavailable while the broker stays reachable
    pub fn block_destination(&self, destination: &str) {
        self.state.lock().blocked.insert(destination.to_string());
    }

    pub fn unblock_destination(&self, destination: &str) {
        self.state.lock().blocked.remove(destination);
    }

    /// Answer NotFound for `destination` until it is created
    pub fn require_creation(&self, destination: &str) {
        self.state.lock().missing.insert(destination.to_string());
    }

    /// Refuse to create `destination`, so a missing one stays missing
    pub fn deny_creation(&self, destination: &str) {
        self.state.lock().denied.insert(destination.to_string());
    }

    /// Successfully published items, oldest first
    pub fn published(&self) -> Vec<OutboundItem> {
        self.state.lock().published.clone()
    }

    /// Published payloads for one destination
    pub fn payloads(&self, destination: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|i| i.destination == destination)
            .map(|i| i.payload.clone())
            .collect()
    }

    /// Every `create_destination` call, in order
    pub fn created_destinations(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Publish calls, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downstream for InMemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, item: &OutboundItem) -> DeliveryResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_reachable() {
            return Err(DeliveryError::Unavailable(format!("{}: connection refused", self.name)));
        }

        let mut state = self.state.lock();
        if state.poisoned.contains(&item.destination) {
            return Err(DeliveryError::Rejected {
                status: 400,
                message: format!("invalid message for {}", item.destination),
            });
        }
        if state.blocked.contains(&item.destination) {
            return Err(DeliveryError::Unavailable(format!("{} is unavailable", item.destination)));
        }
        if state.missing.contains(&item.destination) {
            return Err(DeliveryError::NotFound(item.destination.clone()));
        }

        // Every channel gets its own copy, one subscriber per channel receives it
        if let Some(subs) = state.subscribers.get_mut(&item.destination) {
            subs.retain(|s| !s.sender.is_closed());
            let mut served = HashSet::new();
            for sub in subs.iter() {
                if served.insert(sub.channel.as_str()) {
                    let _ = sub.sender.send(item.clone());
                }
            }
        }

        state.published.push(item.clone());
        Ok(())
    }

    async fn probe(&self) -> DeliveryResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);

        if self.is_reachable() {
            Ok(())
        } else {
            Err(DeliveryError::Unavailable(format!("{}: connection refused", self.name)))
        }
    }

    async fn create_destination(&self, destination: &str) -> DeliveryResult<()> {
        if !self.is_reachable() {
            return Err(DeliveryError::Unavailable(format!("{}: connection refused", self.name)));
        }

        let mut state = self.state.lock();
        if state.denied.contains(destination) {
            return Err(DeliveryError::Rejected {
                status: 403,
                message: format!("cannot create {}", destination),
            });
        }
        state.missing.remove(destination);
        state.created.push(destination.to_string());
        Ok(())
    }
}

#[async_trait]
impl TopicSource for InMemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        handler: &dyn EventHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> DeliveryResult<()> {
        if !self.is_reachable() {
            return Err(DeliveryError::Unavailable(format!("{}: connection refused", self.name)));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                channel: channel.to_string(),
                sender,
            });

        let mut sequence = 0;
        loop {
            tokio::select! {
                item = receiver.recv() => {
                    let Some(item) = item else {
                        return Err(DeliveryError::Unavailable(format!("{}: subscription closed", topic)));
                    };

                    let mut metadata = item.metadata;
                    metadata.insert("channel".to_string(), channel.to_string());
                    let event = RecordedEvent {
                        stream: topic.to_string(),
                        version: sequence,
                        event_type: topic.to_string(),
                        payload: item.payload,
                        metadata,
                    };
                    sequence += 1;

                    if let Err(e) = handler.handle(&event).await {
                        warn!(topic = %topic, error = %e, "Message handler failed");
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

/// Append-only event log held in memory, with long-poll support
#[derive(Debug)]
pub struct InMemoryEventLog {
    name: String,
    available: AtomicBool,
    streams: Mutex<HashMap<String, Vec<RecordedEvent>>>,
    create_calls: Mutex<HashMap<String, usize>>,
    appended: Notify,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_name("eventstore")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: AtomicBool::new(true),
            streams: Mutex::new(HashMap::new()),
            create_calls: Mutex::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    /// Simulate the log being down
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> DeliveryResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeliveryError::Unavailable(format!("{}: temporarily unavailable", self.name)))
        }
    }

    /// Append an event, creating the stream when needed; returns its version
    pub fn append(&self, stream: &str, payload: impl Into<Vec<u8>>) -> u64 {
        self.append_with(stream, stream, payload.into(), Metadata::new())
    }

    fn append_with(&self, stream: &str, event_type: &str, payload: Vec<u8>, metadata: Metadata) -> u64 {
        let version = {
            let mut streams = self.streams.lock();
            let events = streams.entry(stream.to_string()).or_default();
            let version = events.len() as u64;
            events.push(RecordedEvent {
                stream: stream.to_string(),
                version,
                event_type: event_type.to_string(),
                payload,
                metadata,
            });
            version
        };

        self.appended.notify_waiters();
        version
    }

    pub fn events(&self, stream: &str) -> Vec<RecordedEvent> {
        self.streams.lock().get(stream).cloned().unwrap_or_default()
    }

    pub fn create_calls(&self, stream: &str) -> usize {
        self.create_calls.lock().get(stream).copied().unwrap_or(0)
    }

    fn slice(&self, stream: &str, from: u64, max_count: usize) -> DeliveryResult<Option<StreamSlice>> {
        let streams = self.streams.lock();
        let events = streams
            .get(stream)
            .ok_or_else(|| DeliveryError::NotFound(stream.to_string()))?;

        let page: Vec<_> = events
            .iter()
            .skip(from as usize)
            .take(max_count)
            .cloned()
            .collect();

        Ok((!page.is_empty()).then_some(StreamSlice::Events(page)))
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_forward(
        &self,
        stream: &str,
        from: u64,
        max_count: usize,
        long_poll: Option<Duration>,
    ) -> DeliveryResult<StreamSlice> {
        self.check_available()?;

        let notified = self.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(slice) = self.slice(stream, from, max_count)? {
            return Ok(slice);
        }

        let Some(window) = long_poll else {
            return Ok(StreamSlice::EndOfStream);
        };

        let _ = tokio::time::timeout(window, notified).await;
        Ok(self
            .slice(stream, from, max_count)?
            .unwrap_or(StreamSlice::EndOfStream))
    }

    async fn create_stream(&self, stream: &str) -> DeliveryResult<()> {
        self.check_available()?;
        *self.create_calls.lock().entry(stream.to_string()).or_default() += 1;

        let exists = self.streams.lock().contains_key(stream);
        if !exists {
            self.append_with(stream, "", PLACEHOLDER_PAYLOAD.to_vec(), Metadata::new());
        }
        Ok(())
    }
}

#[async_trait]
impl Downstream for InMemoryEventLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, item: &OutboundItem) -> DeliveryResult<()> {
        self.check_available()?;

        let event_type = item
            .metadata
            .get("event_type")
            .cloned()
            .unwrap_or_else(|| item.destination.clone());
        self.append_with(&item.destination, &event_type, item.payload.clone(), item.metadata.clone());
        Ok(())
    }

    async fn probe(&self) -> DeliveryResult<()> {
        self.check_available()
    }

    async fn create_destination(&self, destination: &str) -> DeliveryResult<()> {
        self.create_stream(destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broker_fault_injection() {
        let broker = InMemoryBroker::new("nsq");
        let item = OutboundItem::new("orders", b"1".to_vec());

        broker.set_reachable(false);
        assert!(broker.publish(&item).await.unwrap_err().is_transient());

        broker.set_reachable(true);
        broker.poison_destination("orders");
        assert!(matches!(
            broker.publish(&item).await,
            Err(DeliveryError::Rejected { status: 400, .. })
        ));
        assert_eq!(broker.attempts(), 2);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_broker_creation_is_idempotent() {
        let broker = InMemoryBroker::new("nsq");
        broker.require_creation("mail");

        let item = OutboundItem::new("mail", b"1".to_vec());
        assert!(matches!(broker.publish(&item).await, Err(DeliveryError::NotFound(_))));

        broker.create_destination("mail").await.unwrap();
        broker.create_destination("mail").await.unwrap();
        broker.publish(&item).await.unwrap();
        assert_eq!(broker.payloads("mail"), vec![b"1".to_vec()]);
    }

    #[tokio::test]
    async fn test_event_log_missing_stream() {
        let log = InMemoryEventLog::new();
        let err = log.read_forward("user", 0, 10, None).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));

        log.create_stream("user").await.unwrap();
        log.create_stream("user").await.unwrap();
        assert_eq!(log.events("user").len(), 1);
        assert!(log.events("user")[0].is_placeholder());
        assert_eq!(log.create_calls("user"), 2);
    }

    #[tokio::test]
    async fn test_event_log_pages_and_end() {
        let log = InMemoryEventLog::new();
        for i in 0..3 {
            log.append("user", format!("{{\"id\":{}}}", i).into_bytes());
        }

        match log.read_forward("user", 1, 10, None).await.unwrap() {
            StreamSlice::Events(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].version, 1);
            }
            StreamSlice::EndOfStream => panic!("expected events"),
        }

        assert_eq!(
            log.read_forward("user", 3, 10, None).await.unwrap(),
            StreamSlice::EndOfStream
        );
    }

    #[tokio::test]
    async fn test_event_log_long_poll_wakes_on_append() {
        let log = Arc::new(InMemoryEventLog::new());
        log.create_stream("user").await.unwrap();

        let reader = log.clone();
        let read = tokio::spawn(async move {
            reader
                .read_forward("user", 1, 10, Some(Duration::from_secs(5)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("user", b"{\"id\":1}".to_vec());

        let slice = tokio::time::timeout(Duration::from_secs(1), read)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(slice, StreamSlice::Events(ref e) if e.len() == 1));
    }

    #[tokio::test]
    async fn test_event_log_unavailable() {
        let log = InMemoryEventLog::new();
        log.set_available(false);
        assert!(log.probe().await.unwrap_err().is_transient());
        assert!(log.read_forward("user", 0, 1, None).await.unwrap_err().is_transient());
    }
}
