//! Background retry flusher

use crate::delivery::outbound::OutboundQueue;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one redelivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// The downstream was disconnected and had to be probed
    pub probed: bool,
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
    /// Queue depth after the pass
    pub remaining: usize,
}

/// Periodically redelivers queued items until shutdown
pub struct RetryFlusher {
    queue: Arc<OutboundQueue>,
    interval: Duration,
}

impl RetryFlusher {
    pub fn new(queue: Arc<OutboundQueue>) -> Self {
        let interval = queue.config().poll_interval();
        Self { queue, interval }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` turns true or its sender goes away, then close
    /// the queue and make one last pass.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            downstream = %self.queue.name(),
            interval_ms = self.interval.as_millis() as u64,
            "Retry flusher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if self.queue.is_empty() && self.queue.monitor().is_connected() {
                        continue;
                    }

                    let report = self.queue.flush_cycle().await;
                    if report.delivered > 0 || report.dropped > 0 {
                        debug!(
                            downstream = %self.queue.name(),
                            delivered = report.delivered,
                            dropped = report.dropped,
                            remaining = report.remaining,
                            "Redelivery pass finished"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.queue.close();

        if self.queue.is_empty() {
            info!(downstream = %self.queue.name(), "Retry flusher stopped");
            return;
        }

        let report = self.queue.flush_cycle().await;
        if report.remaining > 0 {
            warn!(
                downstream = %self.queue.name(),
                delivered = report.delivered,
                lost = report.remaining,
                "Retry flusher stopped with undelivered items"
            );
        } else {
            info!(
                downstream = %self.queue.name(),
                delivered = report.delivered,
                "Retry flusher stopped after final flush"
            );
        }
    }
}

/// Spawn a flusher for `queue`
pub fn spawn_flusher(queue: Arc<OutboundQueue>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    RetryFlusher::new(queue).spawn(shutdown)
}
