//! Periodic sampling of delivery counters into Prometheus

use super::{
    DELIVERY_DROPPED_TOTAL, DELIVERY_ONLINE, DELIVERY_RECEIVED_PER_SECOND, DELIVERY_RECEIVED_TOTAL,
    DELIVERY_SENT_PER_SECOND, DELIVERY_SENT_TOTAL, DELIVERY_UNSENT, REPLAY_COMPLETE, UPTIME_SECONDS,
};
use crate::delivery::counters::{CounterSource, RateSample, RateSampler};
use crate::replay::ReplayGate;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Latest rate sample per downstream
pub type SharedRates = Arc<RwLock<BTreeMap<String, RateSample>>>;

struct SampledSource {
    source: Arc<dyn CounterSource>,
    rates: RateSampler,
}

pub struct MetricsSampler {
    sources: Vec<SampledSource>,
    gate: Option<Arc<ReplayGate>>,
    interval: Duration,
    started_at: Instant,
    last_tick: Instant,
    latest: SharedRates,
}

impl MetricsSampler {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            sources: Vec::new(),
            gate: None,
            interval,
            started_at: now,
            last_tick: now,
            latest: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn CounterSource>) -> Self {
        self.sources.push(SampledSource {
            source,
            rates: RateSampler::new(),
        });
        self
    }

    pub fn with_gate(mut self, gate: Arc<ReplayGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Handle on the most recent samples
    pub fn rates(&self) -> SharedRates {
        self.latest.clone()
    }

    /// Take one sample of every source and publish it
    pub fn sample(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let mut latest = BTreeMap::new();

        for sampled in &mut self.sources {
            let name = sampled.source.source_name().to_string();
            let sample = sampled.rates.sample(sampled.source.snapshot(), elapsed);
            let labels = [name.as_str()];

            DELIVERY_UNSENT.with_label_values(&labels).set(sample.unsent as f64);
            DELIVERY_ONLINE
                .with_label_values(&labels)
                .set(if sample.online { 1.0 } else { 0.0 });
            DELIVERY_SENT_PER_SECOND
                .with_label_values(&labels)
                .set(sample.sent_per_second);
            DELIVERY_RECEIVED_PER_SECOND
                .with_label_values(&labels)
                .set(sample.recv_per_second);
            DELIVERY_SENT_TOTAL
                .with_label_values(&labels)
                .inc_by(sample.sent_delta as f64);
            DELIVERY_RECEIVED_TOTAL
                .with_label_values(&labels)
                .inc_by(sample.recv_delta as f64);
            DELIVERY_DROPPED_TOTAL
                .with_label_values(&labels)
                .inc_by(sample.dropped_delta as f64);

            latest.insert(name, sample);
        }

        if let Some(gate) = &self.gate {
            REPLAY_COMPLETE.set(if gate.is_complete() { 1.0 } else { 0.0 });
        }
        UPTIME_SECONDS.set(self.started_at.elapsed().as_secs_f64());

        *self.latest.write() = latest;
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Metrics sampler stopped");
    }
}
