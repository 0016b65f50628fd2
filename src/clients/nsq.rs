//! NSQ producer over the nsqd HTTP API and consumer over the nsqd TCP
//! protocol

use crate::clients::config::NsqConfig;
use crate::clients::{classify_request_error, classify_status};
use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::item::{Metadata, OutboundItem, RecordedEvent};
use crate::delivery::traits::Downstream;
use crate::replay::handler::EventHandler;
use crate::replay::topics::TopicSource;
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAGIC_V2: &[u8] = b"  V2";
const HEARTBEAT: &[u8] = b"_heartbeat_";

const FRAME_RESPONSE: i32 = 0;
const FRAME_ERROR: i32 = 1;
const FRAME_MESSAGE: i32 = 2;

/// Timestamp, attempts and message ID precede the body
const MESSAGE_HEADER_LEN: usize = 8 + 2 + 16;

/// Publishes through `POST /pub`, probes with `GET /ping`, creates topics
/// with `POST /topic/create`.
#[derive(Clone)]
pub struct NsqProducer {
    client: Client,
    base_url: String,
}

impl NsqProducer {
    pub fn new(config: &NsqConfig) -> DeliveryResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DeliveryError::Fatal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.http_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> DeliveryResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl Downstream for NsqProducer {
    fn name(&self) -> &str {
        "nsq"
    }

    async fn publish(&self, item: &OutboundItem) -> DeliveryResult<()> {
        let url = self.url("/pub");

        let response = self
            .client
            .post(&url)
            .query(&[("topic", item.destination.as_str())])
            .body(item.payload.clone())
            .send()
            .await
            .map_err(|e| classify_request_error(e, &url))?;

        Self::check(response).await?;
        debug!(topic = %item.destination, size = item.size(), "Published to NSQ");
        Ok(())
    }

    async fn probe(&self) -> DeliveryResult<()> {
        let url = self.url("/ping");

        // Any HTTP answer means nsqd is listening
        self.client
            .get(&url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_request_error(e, &url))
    }

    async fn create_destination(&self, destination: &str) -> DeliveryResult<()> {
        let url = self.url("/topic/create");

        let response = self
            .client
            .post(&url)
            .query(&[("topic", destination)])
            .send()
            .await
            .map_err(|e| classify_request_error(e, &url))?;

        Self::check(response).await
    }
}

#[derive(Debug, PartialEq)]
struct NsqMessage {
    id: String,
    attempts: u16,
    body: Vec<u8>,
}

#[derive(Debug, PartialEq)]
enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(NsqMessage),
}

/// Read one `[size][type][data]` frame
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let size = reader.read_u32().await? as usize;
    if size < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too short"));
    }

    let kind = reader.read_i32().await?;
    let mut data = vec![0; size - 4];
    reader.read_exact(&mut data).await?;

    match kind {
        FRAME_RESPONSE => Ok(Frame::Response(data)),
        FRAME_ERROR => Ok(Frame::Error(data)),
        FRAME_MESSAGE => {
            if data.len() < MESSAGE_HEADER_LEN {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "message frame too short"));
            }
            let attempts = u16::from_be_bytes([data[8], data[9]]);
            let id = String::from_utf8_lossy(&data[10..MESSAGE_HEADER_LEN]).into_owned();
            let body = data.split_off(MESSAGE_HEADER_LEN);
            Ok(Frame::Message(NsqMessage { id, attempts, body }))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame type {}", other),
        )),
    }
}

fn transport_error(err: io::Error, address: &str) -> DeliveryError {
    match err.kind() {
        io::ErrorKind::TimedOut => DeliveryError::Timeout(format!("{}: {}", address, err)),
        io::ErrorKind::InvalidData => DeliveryError::InvalidPayload(format!("{}: {}", address, err)),
        _ => DeliveryError::Unavailable(format!("{}: {}", address, err)),
    }
}

/// Subscribes to nsqd directly over TCP with one message in flight.
///
/// Messages are finished once the handler returned, whatever the outcome.
#[derive(Debug, Clone)]
pub struct NsqConsumer {
    address: String,
    timeout: Duration,
}

impl NsqConsumer {
    pub fn new(config: &NsqConfig) -> Self {
        Self {
            address: config.tcp_address.clone(),
            timeout: config.request_timeout(),
        }
    }

    async fn subscribe(&self, topic: &str, channel: &str) -> DeliveryResult<TcpStream> {
        let address = self.address.as_str();

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DeliveryError::Timeout(format!("{}: connect timed out", address)))?
            .map_err(|e| transport_error(e, address))?;

        let handshake = format!("SUB {} {}\n", topic, channel);
        stream.write_all(MAGIC_V2).await.map_err(|e| transport_error(e, address))?;
        stream
            .write_all(handshake.as_bytes())
            .await
            .map_err(|e| transport_error(e, address))?;

        let answer = tokio::time::timeout(self.timeout, read_frame(&mut stream))
            .await
            .map_err(|_| DeliveryError::Timeout(format!("{}: no answer to SUB", address)))?
            .map_err(|e| transport_error(e, address))?;

        match answer {
            Frame::Response(body) if body == b"OK" => {}
            Frame::Error(body) => {
                return Err(DeliveryError::Rejected {
                    status: 400,
                    message: String::from_utf8_lossy(&body).into_owned(),
                })
            }
            other => {
                return Err(DeliveryError::InvalidPayload(format!(
                    "{}: unexpected answer to SUB: {:?}",
                    address, other
                )))
            }
        }

        stream.write_all(b"RDY 1\n").await.map_err(|e| transport_error(e, address))?;
        Ok(stream)
    }
}

#[async_trait]
impl TopicSource for NsqConsumer {
    fn name(&self) -> &str {
        "nsq"
    }

    async fn consume(
        &self,
        topic: &str,
        channel: &str,
        handler: &dyn EventHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> DeliveryResult<()> {
        let address = self.address.as_str();
        let mut stream = self.subscribe(topic, channel).await?;
        info!(topic = %topic, channel = %channel, nsqd = %address, "Subscribed to NSQ topic");

        let mut sequence = 0;
        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut stream) => frame.map_err(|e| transport_error(e, address))?,
                _ = shutdown.changed() => {
                    let _ = stream.write_all(b"CLS\n").await;
                    return Ok(());
                }
            };

            match frame {
                Frame::Response(body) if body == HEARTBEAT => {
                    stream.write_all(b"NOP\n").await.map_err(|e| transport_error(e, address))?;
                }
                Frame::Response(body) => {
                    debug!(topic = %topic, response = %String::from_utf8_lossy(&body), "nsqd response");
                }
                Frame::Error(body) => {
                    warn!(topic = %topic, error = %String::from_utf8_lossy(&body), "nsqd reported an error");
                }
                Frame::Message(message) => {
                    let mut metadata = Metadata::new();
                    metadata.insert("channel".to_string(), channel.to_string());
                    metadata.insert("attempts".to_string(), message.attempts.to_string());

                    let event = RecordedEvent {
                        stream: topic.to_string(),
                        version: sequence,
                        event_type: topic.to_string(),
                        payload: message.body,
                        metadata,
                    };
                    sequence += 1;

                    if let Err(e) = handler.handle(&event).await {
                        warn!(topic = %topic, message_id = %message.id, error = %e, "Message handler failed");
                    }

                    let finish = format!("FIN {}\n", message.id);
                    stream
                        .write_all(finish.as_bytes())
                        .await
                        .map_err(|e| transport_error(e, address))?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let producer = NsqProducer::new(&NsqConfig {
            http_url: "http://127.0.0.1:4151/".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(producer.url("/pub"), "http://127.0.0.1:4151/pub");
        assert_eq!(producer.name(), "nsq");
    }

    fn frame(kind: i32, data: &[u8]) -> Vec<u8> {
        let mut bytes = ((data.len() + 4) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&kind.to_be_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    #[tokio::test]
    async fn test_read_message_frame() {
        let mut data = 1_700_000_000_000_000_000i64.to_be_bytes().to_vec();
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(b"0123456789abcdef");
        data.extend_from_slice(br#"{"id":1}"#);

        let bytes = frame(FRAME_MESSAGE, &data);
        let parsed = read_frame(&mut bytes.as_slice()).await.unwrap();

        assert_eq!(
            parsed,
            Frame::Message(NsqMessage {
                id: "0123456789abcdef".to_string(),
                attempts: 3,
                body: br#"{"id":1}"#.to_vec(),
            })
        );
    }

    #[tokio::test]
    async fn test_read_response_and_short_frames() {
        let bytes = frame(FRAME_RESPONSE, HEARTBEAT);
        assert_eq!(
            read_frame(&mut bytes.as_slice()).await.unwrap(),
            Frame::Response(HEARTBEAT.to_vec())
        );

        let bytes = frame(FRAME_MESSAGE, b"short");
        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let consumer = NsqConsumer::new(&NsqConfig {
            tcp_address: "127.0.0.1:1".to_string(),
            request_timeout_ms: 500,
            ..Default::default()
        });

        let err = consumer.subscribe("mail", "kitsvc").await.unwrap_err();
        assert!(err.is_transient());
    }
}
