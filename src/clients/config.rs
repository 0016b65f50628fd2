//! Downstream connection settings

use crate::error::{AppError, Result};
use crate::replay::topics::TopicListener;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message broker used for outbound messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageQueueBackend {
    /// NSQ through the nsqd HTTP API
    #[default]
    Nsq,
    /// NATS core
    Nats,
    /// In-process broker, useful for local runs
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageQueueConfig {
    #[serde(default)]
    pub backend: MessageQueueBackend,

    #[serde(default)]
    pub nsq: NsqConfig,

    #[serde(default)]
    pub nats: NatsConfig,

    /// Topics consumed at startup
    #[serde(default)]
    pub listeners: Vec<TopicListener>,

    /// Path prefix in front of the topic name when forwarding messages to
    /// `replay.forward_base_url`
    #[serde(default = "default_mq_forward_prefix")]
    pub forward_prefix: String,

    /// Pause before resubscribing after a lost subscription (milliseconds)
    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,
}

impl MessageQueueConfig {
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resubscribe_backoff_ms == 0 {
            return Err(AppError::Configuration(
                "message_queue.resubscribe_backoff_ms must be greater than 0".to_string(),
            ));
        }

        let blank = |s: &str| s.trim().is_empty() || s.contains(char::is_whitespace);
        if self.listeners.iter().any(|l| blank(&l.topic) || blank(&l.channel)) {
            return Err(AppError::Configuration(
                "message_queue.listeners need a topic and a channel without spaces".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            backend: MessageQueueBackend::default(),
            nsq: NsqConfig::default(),
            nats: NatsConfig::default(),
            listeners: Vec::new(),
            forward_prefix: default_mq_forward_prefix(),
            resubscribe_backoff_ms: default_resubscribe_backoff_ms(),
        }
    }
}

/// nsqd endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NsqConfig {
    /// Base URL of the nsqd HTTP listener, used for publishing
    #[serde(default = "default_nsq_http_url")]
    pub http_url: String,

    /// nsqd TCP listener (host:port), used for subscribing
    #[serde(default = "default_nsq_tcp_address")]
    pub tcp_address: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl NsqConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            http_url: default_nsq_http_url(),
            tcp_address: default_nsq_tcp_address(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NatsConfig {
    /// NATS server URLs
    #[serde(default = "default_nats_servers")]
    pub servers: Vec<String>,

    /// Connection name
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl NatsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: default_nats_servers(),
            connection_name: default_connection_name(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Event log used for replay and event publishing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventLogBackend {
    /// EventStore through its HTTP/Atom API
    #[default]
    EventStore,
    /// In-process log, lost on restart
    Memory,
}

/// EventStore HTTP endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventStoreConfig {
    #[serde(default)]
    pub backend: EventLogBackend,

    #[serde(default = "default_event_store_url")]
    pub url: String,

    #[serde(default = "default_event_store_username")]
    pub username: String,

    #[serde(default = "default_event_store_password")]
    pub password: String,

    /// Request timeout in milliseconds, on top of any long-poll window
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl EventStoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            backend: EventLogBackend::default(),
            url: default_event_store_url(),
            username: default_event_store_username(),
            password: default_event_store_password(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_nsq_http_url() -> String {
    "http://127.0.0.1:4151".to_string()
}

fn default_nsq_tcp_address() -> String {
    "127.0.0.1:4150".to_string()
}

fn default_nats_servers() -> Vec<String> {
    vec!["nats://127.0.0.1:4222".to_string()]
}

fn default_connection_name() -> String {
    "kitsvc".to_string()
}

fn default_event_store_url() -> String {
    "http://127.0.0.1:2113".to_string()
}

fn default_event_store_username() -> String {
    "admin".to_string()
}

fn default_event_store_password() -> String {
    "changeit".to_string()
}

fn default_mq_forward_prefix() -> String {
    "/mq/".to_string()
}

fn default_resubscribe_backoff_ms() -> u64 {
    3000
}

fn default_request_timeout_ms() -> u64 {
    5000
}
