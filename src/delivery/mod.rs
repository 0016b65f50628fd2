//! Outbound delivery with local queueing.
//!
//! Every downstream (message broker, event store) gets its own
//! [`OutboundQueue`]: an immediate publish attempt, a local in-memory queue for
//! transient failures and a [`RetryFlusher`] that probes the downstream while
//! it is unreachable and redelivers once it is back.
//!
//! Delivery is at-least-once. Nothing is persisted across restarts.

pub mod config;
pub mod connectivity;
pub mod counters;
pub mod error;
pub mod flusher;
pub mod item;
pub mod outbound;
pub mod queue;
pub mod traits;

pub use config::{DeliveryConfig, DrainOrder, ProbeConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, ConnectivityStats, StateTransition};
pub use counters::{CounterSnapshot, CounterSource, DeliveryCounters, RateSample, RateSampler};
pub use error::{DeliveryError, DeliveryResult, ErrorClass};
pub use flusher::{spawn_flusher, FlushReport, RetryFlusher};
pub use item::{is_placeholder, Metadata, OutboundItem, RecordedEvent, PLACEHOLDER_PAYLOAD};
pub use outbound::{OutboundQueue, QueueStatus, SendOutcome};
pub use queue::{LocalQueue, QueuedEntry};
pub use traits::{Downstream, EventLog, StreamSlice};
