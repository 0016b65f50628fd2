//! Shared helpers for the integration tests

#![allow(dead_code)]

use kitsvc_delivery::delivery::{DeliveryConfig, ProbeConfig};
use kitsvc_delivery::replay::ReplayConfig;
use std::future::Future;
use std::time::Duration;

/// Delivery settings with short timings so tests finish quickly
pub fn fast_delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        poll_interval_ms: 10,
        item_pacing_ms: 0,
        max_failed_cycles: 5,
        probe: ProbeConfig {
            attempts: 3,
            delay_ms: 1,
        },
        ..DeliveryConfig::default()
    }
}

pub fn fast_replay_config() -> ReplayConfig {
    ReplayConfig {
        long_poll_secs: 1,
        unavailable_backoff_secs: 1,
        page_size: 2,
        ..ReplayConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    condition()
}

/// Panics when `future` does not complete within `timeout`
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("operation did not complete within {:?}", timeout),
    }
}
