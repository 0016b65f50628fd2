//! Outbound delivery with local queueing and startup event replay.
//!
//! Messages and events are handed to an [`delivery::OutboundQueue`] which
//! publishes immediately when the downstream is reachable and otherwise keeps
//! them in memory until a background flusher can deliver them. At startup,
//! [`replay::ReplayReader`] reads every captured stream from the beginning and
//! fires a one-shot gate once all of them are caught up, while
//! [`replay::TopicReader`] hands messages from subscribed broker topics to
//! the same kind of handlers.

pub mod api;
pub mod clients;
pub mod config;
pub mod delivery;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod replay;
pub mod service;

pub use error::{AppError, Result};
