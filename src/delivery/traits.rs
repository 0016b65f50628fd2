//! Downstream trait abstractions

use crate::delivery::error::DeliveryResult;
use crate::delivery::item::{OutboundItem, RecordedEvent};
use async_trait::async_trait;
use std::time::Duration;

/// A broker or event log that outbound items are published to
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Name used in logs and metric labels
    fn name(&self) -> &str;

    /// Publish one item
    async fn publish(&self, item: &OutboundItem) -> DeliveryResult<()>;

    /// Lightweight reachability check; only transport-level success counts
    async fn probe(&self) -> DeliveryResult<()>;

    /// Create a destination that does not exist yet.
    ///
    /// Creating a destination that already exists must succeed.
    async fn create_destination(&self, destination: &str) -> DeliveryResult<()>;
}

/// Result of a forward read on a stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSlice {
    /// Events in ascending version order
    Events(Vec<RecordedEvent>),
    /// Nothing at or after the requested position
    EndOfStream,
}

/// Append-only event log that can be read back from the beginning
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Read up to `max_count` events starting at version `from`.
    ///
    /// With `long_poll` set, the log may hold the request open for that long
    /// waiting for new events before answering `EndOfStream`.
    async fn read_forward(
        &self,
        stream: &str,
        from: u64,
        max_count: usize,
        long_poll: Option<Duration>,
    ) -> DeliveryResult<StreamSlice>;

    /// Materialize a stream by appending a placeholder event.
    ///
    /// Creating an existing stream is a no-op or a non-fatal error.
    async fn create_stream(&self, stream: &str) -> DeliveryResult<()>;
}
