//! One-shot completion signal for the initial replay

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::info;

/// Fires once every captured stream has reached its end at least once.
///
/// Any number of tasks may wait; all of them observe the same single firing.
#[derive(Debug)]
pub struct ReplayGate {
    expected: usize,
    arrived: AtomicUsize,
    tx: watch::Sender<bool>,
}

impl ReplayGate {
    /// A gate expecting `expected` arrivals. Zero fires immediately.
    pub fn new(expected: usize) -> Self {
        let (tx, _rx) = watch::channel(expected == 0);
        Self {
            expected,
            arrived: AtomicUsize::new(0),
            tx,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn arrived(&self) -> usize {
        self.arrived.load(Ordering::Acquire).min(self.expected)
    }

    /// Record one stream reaching its end; returns true for the arrival that
    /// fired the gate.
    pub fn arrive(&self) -> bool {
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived != self.expected {
            return false;
        }

        self.tx.send_replace(true);
        info!(streams = self.expected, "Initial replay complete");
        true
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the gate has fired
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only returns once fired.
        let _ = rx.wait_for(|complete| *complete).await;
    }
}
