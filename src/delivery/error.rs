//! Error types for outbound delivery and replay

use crate::error::AppError;
use std::fmt;

/// Result type for delivery operations
pub type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

/// How the delivery machinery reacts to a failure.
///
/// Every adapter maps its client library's errors into [`DeliveryError`], and
/// the queue and reader only ever look at this class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Downstream unreachable or temporarily unavailable; queue and retry.
    Transient,
    /// Destination does not exist yet; create it, then retry.
    NotFound,
    /// Retrying cannot help; log and drop.
    Permanent,
    /// Unrecoverable; only raised during initialization.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::NotFound => write!(f, "not_found"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors that can occur while delivering to or reading from a downstream
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Connection refused, dial failure or service unavailable
    #[error("Downstream unavailable: {0}")]
    Unavailable(String),

    /// Request timed out before the downstream answered
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Stream or topic does not exist
    #[error("Destination not found: {0}")]
    NotFound(String),

    /// Downstream refused the request
    #[error("Rejected by downstream (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload or response has an unexpected shape
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Handler failed to process a replayed event
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Queue no longer accepts items
    #[error("Delivery queue '{0}' is closed")]
    Closed(String),

    /// Startup probe never reached the downstream
    #[error("Cannot reach '{downstream}' after {attempts} attempts")]
    ProbeExhausted { downstream: String, attempts: u32 },

    /// Unrecoverable condition
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl DeliveryError {
    /// Classify this error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryError::Unavailable(_) | DeliveryError::Timeout(_) => ErrorClass::Transient,
            DeliveryError::NotFound(_) => ErrorClass::NotFound,
            DeliveryError::Rejected { .. }
            | DeliveryError::Serialization(_)
            | DeliveryError::InvalidPayload(_)
            | DeliveryError::Handler(_)
            | DeliveryError::Closed(_) => ErrorClass::Permanent,
            DeliveryError::ProbeExhausted { .. } | DeliveryError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `class() == ErrorClass::Transient`
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Timeout(msg) => AppError::Timeout(msg),
            DeliveryError::Unavailable(msg) => AppError::Network(msg),
            DeliveryError::NotFound(msg) => AppError::NotFound(msg),
            DeliveryError::Serialization(msg) => AppError::Serialization(msg),
            other => AppError::Delivery(other.to_string()),
        }
    }
}
