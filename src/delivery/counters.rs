//! Per-instance delivery counters and rate sampling

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters owned by one delivery instance
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    sent_total: AtomicU64,
    recv_total: AtomicU64,
    queue_total: AtomicI64,
    dropped_total: AtomicU64,
}

impl DeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.recv_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queue_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self) {
        self.queue_total.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total.load(Ordering::Relaxed)
    }

    pub fn recv_total(&self) -> u64 {
        self.recv_total.load(Ordering::Relaxed)
    }

    /// Current queue depth
    pub fn queue_total(&self) -> u64 {
        self.queue_total.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Snapshot with the connectivity flag supplied by the owner
    pub fn snapshot(&self, all_connected: bool) -> CounterSnapshot {
        CounterSnapshot {
            sent_total: self.sent_total(),
            recv_total: self.recv_total(),
            queue_total: self.queue_total(),
            dropped_total: self.dropped_total(),
            all_connected,
        }
    }
}

/// Read-only view of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub sent_total: u64,
    pub recv_total: u64,
    pub queue_total: u64,
    pub dropped_total: u64,
    pub all_connected: bool,
}

/// Anything the metrics sampler can read counters from
pub trait CounterSource: Send + Sync {
    /// Label value for this source
    fn source_name(&self) -> &str;

    fn snapshot(&self) -> CounterSnapshot;
}

/// Per-second rates derived from two consecutive snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateSample {
    pub sent_per_second: f64,
    pub recv_per_second: f64,
    pub unsent: u64,
    pub online: bool,
    /// Totals that grew since the previous sample
    pub sent_delta: u64,
    pub recv_delta: u64,
    pub dropped_delta: u64,
}

/// Computes rates by delta-from-last-sample
#[derive(Debug, Default)]
pub struct RateSampler {
    last: Option<CounterSnapshot>,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a snapshot taken `elapsed_secs` after the previous one
    pub fn sample(&mut self, current: CounterSnapshot, elapsed_secs: f64) -> RateSample {
        let previous = self.last.unwrap_or_default();
        self.last = Some(current);

        let sent_delta = current.sent_total.saturating_sub(previous.sent_total);
        let recv_delta = current.recv_total.saturating_sub(previous.recv_total);
        let dropped_delta = current.dropped_total.saturating_sub(previous.dropped_total);
        let elapsed = if elapsed_secs > 0.0 { elapsed_secs } else { 1.0 };

        RateSample {
            sent_per_second: sent_delta as f64 / elapsed,
            recv_per_second: recv_delta as f64 / elapsed,
            unsent: current.queue_total,
            online: current.all_connected,
            sent_delta,
            recv_delta,
            dropped_delta,
        }
    }
}
