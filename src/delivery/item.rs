//! Outbound item and replayed event types

use crate::delivery::error::DeliveryResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Free-form annotations attached to an item (service version, id, tags)
pub type Metadata = HashMap<String, String>;

/// Payload written to materialize a stream that did not exist yet
pub const PLACEHOLDER_PAYLOAD: &[u8] = b"{}";

/// One unit of work pending delivery to a downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundItem {
    /// Unique item ID, also used as the event ID on the event log
    pub id: Uuid,

    /// Stream or topic name
    pub destination: String,

    /// Wire payload, owned by the item
    pub payload: Vec<u8>,

    /// Annotations forwarded to the downstream when it supports them
    pub metadata: Metadata,

    /// When the item was created
    pub created_at: DateTime<Utc>,
}

impl OutboundItem {
    /// Create an item from raw payload bytes
    pub fn new(destination: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination: destination.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Create an item by serializing `data` to JSON now
    pub fn json<T: Serialize + ?Sized>(destination: impl Into<String>, data: &T) -> DeliveryResult<Self> {
        let payload = serde_json::to_vec(data)?;
        Ok(Self::new(destination, payload))
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a single metadata entry
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// An event read back from the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Stream the event belongs to
    pub stream: String,

    /// Position of the event in its stream, starting at 0
    pub version: u64,

    /// Event type as stored by the log
    pub event_type: String,

    /// Raw event data
    pub payload: Vec<u8>,

    /// Event metadata
    pub metadata: Metadata,
}

impl RecordedEvent {
    /// Whether this is the sentinel written when the stream was auto-created
    pub fn is_placeholder(&self) -> bool {
        is_placeholder(&self.payload)
    }
}

/// True for the canonical empty marker, ignoring surrounding whitespace
pub fn is_placeholder(payload: &[u8]) -> bool {
    let trimmed = payload.trim_ascii();
    trimmed.is_empty() || trimmed == PLACEHOLDER_PAYLOAD
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_item_captures_payload() {
        let mut data = json!({"id": 1});
        let item = OutboundItem::json("orders", &data).unwrap();

        data["id"] = json!(2);

        assert_eq!(item.destination, "orders");
        assert_eq!(item.payload, br#"{"id":1}"#.to_vec());
    }

    #[test]
    fn test_item_metadata() {
        let item = OutboundItem::new("user.created", b"{}".to_vec())
            .with_meta("version", "1.0.0")
            .with_meta("service", "kitsvc");

        assert_eq!(item.metadata.get("version").unwrap(), "1.0.0");
        assert_eq!(item.metadata.len(), 2);
        assert_eq!(item.size(), 2);
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(is_placeholder(b"{}"));
        assert!(is_placeholder(b" {}\n"));
        assert!(is_placeholder(b""));
        assert!(!is_placeholder(br#"{"id":1}"#));
        assert!(!is_placeholder(b"[]"));
    }
}
