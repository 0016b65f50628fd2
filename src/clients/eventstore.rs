//! EventStore client over the HTTP/Atom API

use crate::clients::config::EventStoreConfig;
use crate::clients::{classify_request_error, classify_status};
use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::item::{Metadata, OutboundItem, RecordedEvent, PLACEHOLDER_PAYLOAD};
use crate::delivery::traits::{Downstream, EventLog, StreamSlice};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENTS_CONTENT_TYPE: &str = "application/vnd.eventstore.events+json";
const ATOM_CONTENT_TYPE: &str = "application/vnd.eventstore.atom+json";

/// Event as written in an append request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewEvent<'a> {
    event_id: Uuid,
    event_type: &'a str,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Metadata>,
}

/// Entries stay raw so one bad entry does not make the page unreadable
#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(default)]
    entries: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtomEntry {
    event_number: u64,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default, rename = "metaData")]
    meta_data: Option<Value>,
}

impl AtomEntry {
    fn into_event(self, stream: &str) -> RecordedEvent {
        RecordedEvent {
            stream: stream.to_string(),
            version: self.event_number,
            event_type: self.event_type,
            payload: value_bytes(self.data),
            metadata: self.meta_data.map(metadata_map).unwrap_or_default(),
        }
    }
}

/// Decode a page oldest first.
///
/// An entry that does not decode but still carries its `eventNumber` becomes
/// an empty event, which the reader skips as a placeholder, so the stream
/// position moves past it. Entries without a number cannot be placed and are
/// left out.
fn decode_entries(stream: &str, entries: Vec<Value>) -> Vec<RecordedEvent> {
    let mut events: Vec<_> = entries
        .into_iter()
        .filter_map(|raw| {
            let version = raw.get("eventNumber").and_then(Value::as_u64);

            match serde_json::from_value::<AtomEntry>(raw) {
                Ok(entry) => Some(entry.into_event(stream)),
                Err(e) => {
                    warn!(stream = %stream, version, error = %e, "Cannot decode event, skipping");
                    version.map(|version| RecordedEvent {
                        stream: stream.to_string(),
                        version,
                        event_type: String::new(),
                        payload: Vec::new(),
                        metadata: Metadata::new(),
                    })
                }
            }
        })
        .collect();

    // The feed lists entries newest first
    events.sort_by_key(|e| e.version);
    events
}

/// Embedded bodies arrive either as a JSON string or as a JSON value
fn value_bytes(value: Option<Value>) -> Vec<u8> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => s.into_bytes(),
        Some(other) => other.to_string().into_bytes(),
    }
}

fn metadata_map(value: Value) -> Metadata {
    let value = match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::Null),
        other => other,
    };

    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect(),
        _ => Metadata::new(),
    }
}

/// Reads and appends streams on an EventStore node
#[derive(Clone)]
pub struct EventStoreClient {
    client: Client,
    config: EventStoreConfig,
    base_url: String,
}

impl EventStoreClient {
    pub fn new(config: EventStoreConfig) -> DeliveryResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| DeliveryError::Fatal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn stream_url(&self, stream: &str) -> String {
        format!("{}/streams/{}", self.base_url, stream)
    }

    fn authorized(&self, request: RequestBuilder, timeout: Duration) -> RequestBuilder {
        request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .timeout(timeout)
    }

    async fn append(&self, stream: &str, event: NewEvent<'_>, expected_version: Option<i64>) -> DeliveryResult<Response> {
        let url = self.stream_url(stream);
        let body = serde_json::to_vec(&[event])?;

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, EVENTS_CONTENT_TYPE)
            .body(body);

        if let Some(version) = expected_version {
            request = request.header("ES-ExpectedVersion", version.to_string());
        }

        self.authorized(request, self.config.request_timeout())
            .send()
            .await
            .map_err(|e| classify_request_error(e, &url))
    }

    async fn error_for(response: Response) -> DeliveryError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }
}

#[async_trait]
impl EventLog for EventStoreClient {
    fn name(&self) -> &str {
        "eventstore"
    }

    async fn read_forward(
        &self,
        stream: &str,
        from: u64,
        max_count: usize,
        long_poll: Option<Duration>,
    ) -> DeliveryResult<StreamSlice> {
        let url = format!("{}/{}/forward/{}", self.stream_url(stream), from, max_count);

        let mut request = self
            .client
            .get(&url)
            .query(&[("embed", "body")])
            .header(header::ACCEPT, ATOM_CONTENT_TYPE);

        let mut timeout = self.config.request_timeout();
        if let Some(window) = long_poll {
            request = request.header("ES-LongPoll", window.as_secs().to_string());
            timeout += window;
        }

        let response = self
            .authorized(request, timeout)
            .send()
            .await
            .map_err(|e| classify_request_error(e, &url))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let feed: AtomFeed = response
            .json()
            .await
            .map_err(|e| DeliveryError::InvalidPayload(format!("Unreadable feed for {}: {}", stream, e)))?;

        let events = decode_entries(stream, feed.entries);
        if events.is_empty() {
            return Ok(StreamSlice::EndOfStream);
        }

        debug!(stream = %stream, from, count = events.len(), "Read events");
        Ok(StreamSlice::Events(events))
    }

    async fn create_stream(&self, stream: &str) -> DeliveryResult<()> {
        let placeholder: Value = serde_json::from_slice(PLACEHOLDER_PAYLOAD)?;
        let event = NewEvent {
            event_id: Uuid::new_v4(),
            event_type: "",
            data: placeholder,
            metadata: None,
        };

        // -1: only append when the stream does not exist yet
        let response = self.append(stream, event, Some(-1)).await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        if status == StatusCode::BAD_REQUEST {
            debug!(stream = %stream, "Stream already exists");
            return Ok(());
        }

        Err(Self::error_for(response).await)
    }
}

#[async_trait]
impl Downstream for EventStoreClient {
    fn name(&self) -> &str {
        "eventstore"
    }

    async fn publish(&self, item: &OutboundItem) -> DeliveryResult<()> {
        let data: Value = serde_json::from_slice(&item.payload)
            .map_err(|e| DeliveryError::InvalidPayload(format!("Event body is not JSON: {}", e)))?;

        let event_type = item
            .metadata
            .get("event_type")
            .map(String::as_str)
            .unwrap_or(item.destination.as_str());

        // The item ID doubles as the event ID so a redelivered item is deduplicated
        let event = NewEvent {
            event_id: item.id,
            event_type,
            data,
            metadata: (!item.metadata.is_empty()).then_some(&item.metadata),
        };

        let response = self.append(&item.destination, event, None).await?;
        if response.status().is_success() {
            return Ok(());
        }

        Err(Self::error_for(response).await)
    }

    async fn probe(&self) -> DeliveryResult<()> {
        let url = format!("{}/info", self.base_url);

        self.authorized(self.client.get(&url), self.config.request_timeout())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_request_error(e, &url))
    }

    async fn create_destination(&self, destination: &str) -> DeliveryResult<()> {
        self.create_stream(destination).await
    }
}
