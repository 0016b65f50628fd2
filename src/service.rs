//! Wiring of queues, flushers, replay, topic capture, metrics sampling and
//! discovery

use crate::clients::{
    EventLogBackend, EventStoreClient, InMemoryBroker, InMemoryEventLog, MessageQueueBackend, NatsProducer,
    NsqConsumer, NsqProducer,
};
use crate::config::Config;
use crate::delivery::counters::RateSample;
use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::flusher::spawn_flusher;
use crate::delivery::outbound::{OutboundQueue, QueueStatus};
use crate::delivery::traits::{Downstream, EventLog};
use crate::discovery::{register_when_replayed, ConsulAgent, ServiceRegistration};
use crate::error::Result;
use crate::metrics::{MetricsSampler, SharedRates};
use crate::replay::{
    handler_fn, EventHandler, HttpForwardHandler, ProgressSnapshot, ReplayGate, ReplayHandle, ReplayProgress,
    ReplayReader, TopicReader, TopicSource,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Both downstreams connected, replay not started yet
pub struct DeliveryService {
    config: Config,
    events: Arc<OutboundQueue>,
    messages: Arc<OutboundQueue>,
    reader: ReplayReader,
    topics: TopicReader,
}

impl DeliveryService {
    /// Build the configured clients and run both startup probes.
    ///
    /// Fails when either downstream stays unreachable.
    pub async fn connect(config: Config) -> Result<Self> {
        let (event_store, event_log) = match config.event_store.backend {
            EventLogBackend::EventStore => {
                let client = Arc::new(EventStoreClient::new(config.event_store.clone())?);
                let downstream: Arc<dyn Downstream> = client.clone();
                let log: Arc<dyn EventLog> = client;
                (downstream, log)
            }
            EventLogBackend::Memory => {
                let memory = Arc::new(InMemoryEventLog::new());
                let downstream: Arc<dyn Downstream> = memory.clone();
                let log: Arc<dyn EventLog> = memory;
                (downstream, log)
            }
        };

        let (broker, topic_source) = match config.message_queue.backend {
            MessageQueueBackend::Nsq => {
                let producer: Arc<dyn Downstream> = Arc::new(NsqProducer::new(&config.message_queue.nsq)?);
                let consumer: Arc<dyn TopicSource> = Arc::new(NsqConsumer::new(&config.message_queue.nsq));
                (producer, consumer)
            }
            MessageQueueBackend::Nats => {
                let nats = Arc::new(NatsProducer::new(config.message_queue.nats.clone())?);
                let producer: Arc<dyn Downstream> = nats.clone();
                let consumer: Arc<dyn TopicSource> = nats;
                (producer, consumer)
            }
            MessageQueueBackend::Memory => {
                let memory = Arc::new(InMemoryBroker::new("memory"));
                let producer: Arc<dyn Downstream> = memory.clone();
                let consumer: Arc<dyn TopicSource> = memory;
                (producer, consumer)
            }
        };

        Self::from_parts(config, event_store, event_log, broker, topic_source).await
    }

    /// Connect with explicit downstreams
    pub async fn from_parts(
        config: Config,
        event_store: Arc<dyn Downstream>,
        event_log: Arc<dyn EventLog>,
        broker: Arc<dyn Downstream>,
        topic_source: Arc<dyn TopicSource>,
    ) -> Result<Self> {
        info!(event_store = %event_store.name(), broker = %broker.name(), "Connecting to downstreams");

        let events = OutboundQueue::connect(event_store, config.delivery.clone()).await?;
        let messages = OutboundQueue::connect(broker.clone(), config.delivery.clone()).await?;

        // Replayed events count as received on the event log's counters
        let mut reader = ReplayReader::new(event_log, config.replay.clone(), events.counters());

        let handler = default_handler(&config, &config.replay.forward_prefix)?;
        for stream in &config.replay.streams {
            reader.capture(stream.clone(), handler.clone());
        }

        // and consumed messages on the broker's
        let mut topics = TopicReader::new(
            topic_source,
            broker,
            messages.counters(),
            config.message_queue.resubscribe_backoff(),
        );

        let handler = default_handler(&config, &config.message_queue.forward_prefix)?;
        for listener in &config.message_queue.listeners {
            topics.capture(listener.topic.clone(), listener.channel.clone(), handler.clone());
        }

        Ok(Self {
            config,
            events,
            messages,
            reader,
            topics,
        })
    }

    pub fn events(&self) -> &Arc<OutboundQueue> {
        &self.events
    }

    pub fn messages(&self) -> &Arc<OutboundQueue> {
        &self.messages
    }

    /// Replay `stream` into `handler` in addition to the configured streams
    pub fn capture(&mut self, stream: impl Into<String>, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.reader.capture(stream, handler);
        self
    }

    /// Consume `topic` as `channel` into `handler` in addition to the
    /// configured listeners
    pub fn capture_topic(
        &mut self,
        topic: impl Into<String>,
        channel: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.topics.capture(topic, channel, handler);
        self
    }

    /// Spawn every background task
    pub fn start(self) -> Result<RunningService> {
        let started_at = Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(spawn_flusher(self.events.clone(), shutdown_rx.clone()));
        tasks.push(spawn_flusher(self.messages.clone(), shutdown_rx.clone()));

        let ReplayHandle { gate, progress, tasks: replay_tasks } = self.reader.start(shutdown_rx.clone());
        let replay_task = tokio::spawn(
            ReplayHandle {
                gate: gate.clone(),
                progress: progress.clone(),
                tasks: replay_tasks,
            }
            .join(),
        );

        tasks.extend(self.topics.start(shutdown_rx.clone()));

        let sampler = MetricsSampler::new(self.config.observability.metrics_interval())
            .with_source(self.events.clone())
            .with_source(self.messages.clone())
            .with_gate(gate.clone());
        let rates = sampler.rates();
        tasks.push(sampler.spawn(shutdown_rx.clone()));

        if self.config.discovery.enabled {
            let agent = ConsulAgent::new(
                self.config.discovery.consul_url.clone(),
                std::time::Duration::from_millis(self.config.discovery.request_timeout_ms),
            )?;
            let registration = ServiceRegistration::from_config(&self.config.discovery, env!("CARGO_PKG_VERSION"));

            info!(service_id = %registration.id, "Service will register once events are replayed");
            tasks.push(register_when_replayed(
                Arc::new(agent),
                gate.clone(),
                registration,
                shutdown_rx,
            ));
        }

        let view = ServiceView {
            events: self.events,
            messages: self.messages,
            gate,
            progress,
            rates,
            started_at,
        };

        Ok(RunningService {
            view,
            shutdown_tx,
            tasks,
            replay_task: Some(replay_task),
        })
    }
}

/// Forward to the service's own router under `prefix` when a base URL is
/// configured, otherwise only log
fn default_handler(config: &Config, prefix: &str) -> DeliveryResult<Arc<dyn EventHandler>> {
    match &config.replay.forward_base_url {
        Some(base_url) => Ok(Arc::new(HttpForwardHandler::new(
            base_url.clone(),
            prefix.to_string(),
            config.event_store.request_timeout(),
        )?)),
        None => Ok(Arc::new(handler_fn(|event| async move {
            debug!(
                source = %event.stream,
                version = event.version,
                event_type = %event.event_type,
                "Received event"
            );
            Ok(())
        }))),
    }
}

/// Read-only view shared with the HTTP layer
#[derive(Clone)]
pub struct ServiceView {
    pub events: Arc<OutboundQueue>,
    pub messages: Arc<OutboundQueue>,
    pub gate: Arc<ReplayGate>,
    progress: Vec<Arc<ReplayProgress>>,
    rates: SharedRates,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub uptime_seconds: u64,
    pub replay_complete: bool,
    pub downstreams: Vec<QueueStatus>,
    pub rates: BTreeMap<String, RateSample>,
    pub streams: Vec<ProgressSnapshot>,
}

impl ServiceView {
    pub fn is_ready(&self) -> bool {
        self.gate.is_complete()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            uptime_seconds: self.uptime_seconds(),
            replay_complete: self.is_ready(),
            downstreams: vec![self.events.status(), self.messages.status()],
            rates: self.rates.read().clone(),
            streams: self.progress.iter().map(|p| p.snapshot()).collect(),
        }
    }
}

/// Handle on the running background tasks
pub struct RunningService {
    view: ServiceView,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    replay_task: Option<JoinHandle<DeliveryResult<()>>>,
}

impl RunningService {
    pub fn view(&self) -> ServiceView {
        self.view.clone()
    }

    /// Resolves only when a replay task ended with an error
    pub async fn replay_failed(&mut self) -> DeliveryError {
        if let Some(task) = self.replay_task.as_mut() {
            let result = task.await;
            self.replay_task = None;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return e,
                Err(e) => return DeliveryError::Fatal(format!("Replay task failed: {}", e)),
            }
        }

        std::future::pending().await
    }

    /// Stop accepting sends, flush what can still be delivered and wait for
    /// every task
    pub async fn shutdown(self) -> DeliveryResult<()> {
        info!("Shutting down delivery service");
        self.shutdown_tx.send_replace(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let result = match self.replay_task {
            Some(task) => task
                .await
                .map_err(|e| DeliveryError::Fatal(format!("Replay task failed: {}", e)))?,
            None => Ok(()),
        };

        let stats = self.view.stats();
        for downstream in &stats.downstreams {
            info!(
                downstream = %downstream.downstream,
                sent = downstream.counters.sent_total,
                dropped = downstream.counters.dropped_total,
                lost = downstream.depth,
                "Downstream closed"
            );
        }

        result
    }
}
