//! Delivery queue configuration

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest allowed flusher poll interval
pub const MAX_POLL_INTERVAL_MS: u64 = 1_000;

/// Order in which the flusher walks the local queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DrainOrder {
    /// Most recently queued item first
    #[default]
    NewestFirst,
    /// Oldest queued item first
    OldestFirst,
}

/// Reachability probe settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Attempts before the startup probe gives up
    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,

    /// Delay between attempts (milliseconds)
    #[serde(default = "default_probe_delay_ms")]
    pub delay_ms: u64,
}

impl ProbeConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: default_probe_attempts(),
            delay_ms: default_probe_delay_ms(),
        }
    }
}

/// Settings shared by the send path and the retry flusher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    /// Flusher wake-up interval (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause between redelivery attempts within one pass (milliseconds)
    #[serde(default = "default_item_pacing_ms")]
    pub item_pacing_ms: u64,

    /// Failed cycles before a queued item is dropped; transient failures do not count
    #[serde(default = "default_max_failed_cycles")]
    pub max_failed_cycles: u32,

    /// Redelivery order
    #[serde(default)]
    pub drain_order: DrainOrder,

    /// Reachability probe
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn item_pacing(&self) -> Duration {
        Duration::from_millis(self.item_pacing_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 || self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(AppError::Configuration(format!(
                "poll_interval_ms must be between 1 and {}",
                MAX_POLL_INTERVAL_MS
            )));
        }

        if self.max_failed_cycles == 0 {
            return Err(AppError::Configuration(
                "max_failed_cycles must be greater than 0".to_string(),
            ));
        }

        if self.probe.attempts == 0 {
            return Err(AppError::Configuration(
                "probe.attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            item_pacing_ms: default_item_pacing_ms(),
            max_failed_cycles: default_max_failed_cycles(),
            drain_order: DrainOrder::default(),
            probe: ProbeConfig::default(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_item_pacing_ms() -> u64 {
    2
}

fn default_max_failed_cycles() -> u32 {
    100
}

fn default_probe_attempts() -> u32 {
    30
}

fn default_probe_delay_ms() -> u64 {
    1000
}
