//! Replay reader configuration

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayConfig {
    /// Long-poll window once a stream has been caught up (seconds)
    #[serde(default = "default_long_poll_secs")]
    pub long_poll_secs: u64,

    /// Pause after the event log refused a read (seconds)
    #[serde(default = "default_unavailable_backoff_secs")]
    pub unavailable_backoff_secs: u64,

    /// Events requested per read
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Streams replayed at startup
    #[serde(default)]
    pub streams: Vec<String>,

    /// Base URL replayed events are forwarded to; forwarding is off when unset
    #[serde(default)]
    pub forward_base_url: Option<String>,

    /// Path prefix in front of the stream name when forwarding
    #[serde(default = "default_forward_prefix")]
    pub forward_prefix: String,
}

impl ReplayConfig {
    pub fn long_poll(&self) -> Duration {
        Duration::from_secs(self.long_poll_secs)
    }

    pub fn unavailable_backoff(&self) -> Duration {
        Duration::from_secs(self.unavailable_backoff_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.long_poll_secs == 0 {
            return Err(AppError::Configuration(
                "replay.long_poll_secs must be greater than 0".to_string(),
            ));
        }

        if self.unavailable_backoff_secs == 0 {
            return Err(AppError::Configuration(
                "replay.unavailable_backoff_secs must be greater than 0".to_string(),
            ));
        }

        if self.page_size == 0 {
            return Err(AppError::Configuration(
                "replay.page_size must be greater than 0".to_string(),
            ));
        }

        if self.streams.iter().any(|s| s.trim().is_empty()) {
            return Err(AppError::Configuration(
                "replay.streams must not contain empty names".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            long_poll_secs: default_long_poll_secs(),
            unavailable_backoff_secs: default_unavailable_backoff_secs(),
            page_size: default_page_size(),
            streams: Vec::new(),
            forward_base_url: None,
            forward_prefix: default_forward_prefix(),
        }
    }
}

fn default_long_poll_secs() -> u64 {
    15
}

fn default_unavailable_backoff_secs() -> u64 {
    3
}

fn default_page_size() -> usize {
    20
}

fn default_forward_prefix() -> String {
    "/es/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplayConfig::default();
        assert_eq!(config.long_poll(), Duration::from_secs(15));
        assert_eq!(config.unavailable_backoff(), Duration::from_secs(3));
        assert_eq!(config.forward_prefix, "/es/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_stream_name() {
        let config = ReplayConfig {
            streams: vec!["user".into(), " ".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_backoff() {
        let config = ReplayConfig {
            unavailable_backoff_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
