//! Per-stream replay progress

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Position and tallies of one stream reader, shared with the stats endpoint
#[derive(Debug)]
pub struct ReplayProgress {
    stream: String,
    position: AtomicU64,
    has_reached_end: AtomicBool,
    forwarded: AtomicU64,
    skipped: AtomicU64,
    handler_failures: AtomicU64,
}

impl ReplayProgress {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            position: AtomicU64::new(0),
            has_reached_end: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Next version to read
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn advance_to(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    pub fn has_reached_end(&self) -> bool {
        self.has_reached_end.load(Ordering::Acquire)
    }

    /// Returns true the first time the end of the stream is reached
    pub fn mark_reached_end(&self) -> bool {
        !self.has_reached_end.swap(true, Ordering::AcqRel)
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stream: self.stream.clone(),
            position: self.position(),
            has_reached_end: self.has_reached_end(),
            forwarded: self.forwarded(),
            skipped: self.skipped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub stream: String,
    pub position: u64,
    pub has_reached_end: bool,
    pub forwarded: u64,
    pub skipped: u64,
    pub handler_failures: u64,
}
