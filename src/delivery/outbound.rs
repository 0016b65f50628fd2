//! Send path and redelivery pass for one downstream

use crate::delivery::config::DeliveryConfig;
use crate::delivery::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::delivery::counters::{CounterSnapshot, CounterSource, DeliveryCounters};
use crate::delivery::error::{DeliveryError, DeliveryResult, ErrorClass};
use crate::delivery::flusher::FlushReport;
use crate::delivery::item::{Metadata, OutboundItem};
use crate::delivery::queue::{LocalQueue, QueuedEntry};
use crate::delivery::traits::Downstream;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to an item handed to [`OutboundQueue::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    /// Published immediately
    Delivered,
    /// Held in the local queue for the flusher
    Queued,
    /// Failed permanently and was discarded
    Dropped,
    /// The queue was closed
    Rejected,
}

/// Status of a delivery queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub downstream: String,
    pub state: ConnectivityState,
    pub depth: usize,
    pub closed: bool,
    pub counters: CounterSnapshot,
}

/// Durable-enough outbound queue in front of one downstream.
///
/// `send` never fails the caller: transient failures are queued and retried
/// by the flusher, permanent ones are logged and dropped.
pub struct OutboundQueue {
    name: String,
    downstream: Arc<dyn Downstream>,
    monitor: ConnectivityMonitor,
    queue: LocalQueue,
    counters: Arc<DeliveryCounters>,
    config: DeliveryConfig,
    closed: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
}

impl OutboundQueue {
    /// Create a queue without probing the downstream
    pub fn new(downstream: Arc<dyn Downstream>, config: DeliveryConfig) -> Self {
        let name = downstream.name().to_string();

        Self {
            monitor: ConnectivityMonitor::new(name.clone(), config.probe.clone()),
            queue: LocalQueue::new(config.drain_order),
            name,
            downstream,
            counters: Arc::new(DeliveryCounters::new()),
            config,
            closed: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a queue once the startup probe reached the downstream.
    ///
    /// Fails with [`DeliveryError::ProbeExhausted`] when it never did.
    pub async fn connect(downstream: Arc<dyn Downstream>, config: DeliveryConfig) -> DeliveryResult<Arc<Self>> {
        let queue = Self::new(downstream, config);
        queue.monitor.initialize(queue.downstream.as_ref()).await?;
        Ok(Arc::new(queue))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Counters shared with anything else reporting for this downstream
    pub fn counters(&self) -> Arc<DeliveryCounters> {
        self.counters.clone()
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting new items
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(downstream = %self.name, unsent = self.queue.len(), "Delivery queue closed");
        }
    }

    /// Attempt one immediate delivery, queueing on transient failure
    pub async fn send(&self, item: OutboundItem) -> SendOutcome {
        if self.is_closed() {
            warn!(
                downstream = %self.name,
                destination = %item.destination,
                "Delivery queue is closed, item rejected"
            );
            return SendOutcome::Rejected;
        }

        match self.downstream.publish(&item).await {
            Ok(()) => {
                self.counters.record_sent();
                debug!(
                    downstream = %self.name,
                    destination = %item.destination,
                    size = item.size(),
                    "Item delivered"
                );
                SendOutcome::Delivered
            }
            Err(err) => self.handle_send_failure(item, err).await,
        }
    }

    /// Run [`send`](Self::send) on its own task
    pub fn send_detached(self: &Arc<Self>, item: OutboundItem) -> JoinHandle<SendOutcome> {
        let queue = self.clone();
        tokio::spawn(async move { queue.send(item).await })
    }

    /// Serialize `data` to JSON and send it in the background
    pub fn emit<T: Serialize + ?Sized>(self: &Arc<Self>, destination: &str, data: &T, metadata: Metadata) {
        match OutboundItem::json(destination, data) {
            Ok(item) => {
                self.send_detached(item.with_metadata(metadata));
            }
            Err(err) => {
                self.counters.record_dropped();
                error!(
                    downstream = %self.name,
                    destination = %destination,
                    error = %err,
                    "Cannot encode item, dropped"
                );
            }
        }
    }

    async fn handle_send_failure(&self, item: OutboundItem, err: DeliveryError) -> SendOutcome {
        match err.class() {
            ErrorClass::Transient => {
                self.monitor.mark_disconnected(err.to_string());
                self.enqueue(item);
                SendOutcome::Queued
            }
            ErrorClass::NotFound => {
                self.ensure_destination(&item.destination).await;
                self.enqueue(item);
                SendOutcome::Queued
            }
            ErrorClass::Permanent | ErrorClass::Fatal => {
                self.counters.record_dropped();
                error!(
                    downstream = %self.name,
                    destination = %item.destination,
                    error = %err,
                    "Item cannot be delivered, dropped"
                );
                SendOutcome::Dropped
            }
        }
    }

    fn enqueue(&self, item: OutboundItem) {
        let destination = item.destination.clone();
        let unsent = self.queue.push(item);

        self.counters.record_queued();
        self.counters.record_sent();

        warn!(
            downstream = %self.name,
            destination = %destination,
            unsent,
            "Item will be sent when the downstream is back online"
        );
    }

    async fn ensure_destination(&self, destination: &str) {
        match self.downstream.create_destination(destination).await {
            Ok(()) => info!(downstream = %self.name, destination = %destination, "Destination created"),
            Err(e) => warn!(
                downstream = %self.name,
                destination = %destination,
                error = %e,
                "Cannot create destination"
            ),
        }
    }

    /// One redelivery pass.
    ///
    /// While disconnected this only probes; a successful probe flips the
    /// monitor back and the queue is drained in the same pass.
    pub async fn flush_cycle(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();

        if !self.monitor.is_connected() {
            report.probed = true;

            if !self.monitor.probe_once(self.downstream.as_ref()).await {
                report.remaining = self.queue.len();
                return report;
            }

            self.monitor.mark_connected();
            info!(
                downstream = %self.name,
                unsent = self.queue.len(),
                "Downstream is back online, queued items will be sent"
            );
        }

        let pacing = self.config.item_pacing();

        for (index, entry) in self.queue.snapshot().into_iter().enumerate() {
            if index > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }

            report.attempted += 1;

            match self.downstream.publish(&entry.item).await {
                Ok(()) => {
                    if self.queue.remove(entry.id()).is_some() {
                        self.counters.record_dequeued();
                        report.delivered += 1;
                    }
                }
                Err(err) => {
                    if self.handle_redelivery_failure(&entry, err).await {
                        report.dropped += 1;
                    }
                }
            }
        }

        report.remaining = self.queue.len();
        report
    }

    /// Returns true when the entry was dropped.
    ///
    /// Transient failures never count toward `max_failed_cycles`: the item
    /// stays queued for as long as the outage lasts.
    async fn handle_redelivery_failure(&self, entry: &QueuedEntry, err: DeliveryError) -> bool {
        match err.class() {
            ErrorClass::Permanent | ErrorClass::Fatal => self.drop_entry(entry, &err),
            ErrorClass::Transient => {
                self.monitor.mark_disconnected(err.to_string());
                debug!(
                    downstream = %self.name,
                    item_id = %entry.id(),
                    error = %err,
                    "Redelivery failed transiently, item kept"
                );
                false
            }
            ErrorClass::NotFound => {
                self.ensure_destination(&entry.item.destination).await;

                match self.queue.record_failure(entry.id()) {
                    Some(failed) if failed >= self.config.max_failed_cycles => self.drop_entry(entry, &err),
                    Some(failed) => {
                        debug!(
                            downstream = %self.name,
                            item_id = %entry.id(),
                            failed_cycles = failed,
                            error = %err,
                            "Redelivery failed, will retry"
                        );
                        false
                    }
                    None => false,
                }
            }
        }
    }

    fn drop_entry(&self, entry: &QueuedEntry, err: &DeliveryError) -> bool {
        if self.queue.remove(entry.id()).is_none() {
            return false;
        }

        self.counters.record_dequeued();
        self.counters.record_dropped();

        error!(
            downstream = %self.name,
            destination = %entry.item.destination,
            item_id = %entry.id(),
            failed_cycles = entry.failed_cycles + 1,
            error = %err,
            "Giving up on queued item, dropped"
        );
        true
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            downstream: self.name.clone(),
            state: self.monitor.state(),
            depth: self.queue.len(),
            closed: self.is_closed(),
            counters: self.snapshot(),
        }
    }
}

impl CounterSource for OutboundQueue {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot(self.monitor.is_connected())
    }
}
