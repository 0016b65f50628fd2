//! Downstream adapters.
//!
//! Every adapter maps its client library's failures into [`DeliveryError`]
//! here or in its own module, so the queue and the replay reader only ever
//! look at the error class.

pub mod config;
pub mod eventstore;
pub mod memory;
pub mod nats;
pub mod nsq;

pub use config::{EventLogBackend, EventStoreConfig, MessageQueueBackend, MessageQueueConfig, NatsConfig, NsqConfig};
pub use eventstore::EventStoreClient;
pub use memory::{InMemoryBroker, InMemoryEventLog};
pub use nats::NatsProducer;
pub use nsq::{NsqConsumer, NsqProducer};

use crate::delivery::error::DeliveryError;
use reqwest::StatusCode;

/// Map a transport-level reqwest failure
pub fn classify_request_error(err: reqwest::Error, target: &str) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout(format!("{}: {}", target, err))
    } else if err.is_builder() || err.is_decode() {
        DeliveryError::InvalidPayload(format!("{}: {}", target, err))
    } else {
        // Connect, request and body errors all mean the peer was not reached
        DeliveryError::Unavailable(format!("{}: {}", target, err))
    }
}

/// Map a non-success HTTP status
pub fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("unknown").to_string()
    } else {
        body.trim().to_string()
    };

    match status {
        StatusCode::NOT_FOUND => DeliveryError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => DeliveryError::Timeout(message),
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::Unavailable(message),
        s if s.is_server_error() => DeliveryError::Unavailable(message),
        s => DeliveryError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}
