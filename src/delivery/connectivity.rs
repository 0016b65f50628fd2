//! Connectivity monitor for a single downstream.
//!
//! The monitor starts connected once the startup probe succeeds. Publish
//! failures of the transient class flip it to disconnected; only a successful
//! probe made by the retry flusher flips it back.

use crate::delivery::config::ProbeConfig;
use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::traits::Downstream;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Reachability of a downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// Publishes are expected to succeed
    Connected,
    /// Publishes are queued until a probe succeeds
    Disconnected,
}

impl ConnectivityState {
    /// Convert state to numeric value for Prometheus gauge
    pub fn to_metric_value(&self) -> f64 {
        match self {
            ConnectivityState::Connected => 1.0,
            ConnectivityState::Disconnected => 0.0,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Connected => write!(f, "connected"),
            ConnectivityState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Represents a connectivity state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: ConnectivityState,
    /// New state
    pub to: ConnectivityState,
    /// When the transition occurred
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition
    pub reason: String,
}

#[derive(Debug, Clone)]
struct StateData {
    state: ConnectivityState,
    last_state_change: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
    transition_count: u64,
}

impl StateData {
    fn new() -> Self {
        Self {
            state: ConnectivityState::Connected,
            last_state_change: Utc::now(),
            disconnected_at: None,
            transition_count: 0,
        }
    }

    fn transition_to(&mut self, new_state: ConnectivityState, reason: String) -> Option<StateTransition> {
        if self.state == new_state {
            return None;
        }

        let transition = StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        };

        self.state = new_state;
        self.last_state_change = transition.timestamp;
        self.transition_count += 1;
        self.disconnected_at = match new_state {
            ConnectivityState::Disconnected => Some(transition.timestamp),
            ConnectivityState::Connected => None,
        };

        Some(transition)
    }
}

/// Point-in-time view of the monitor
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityStats {
    pub downstream: String,
    pub state: ConnectivityState,
    pub last_state_change: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub transition_count: u64,
}

/// Tracks whether a downstream is currently reachable
#[derive(Debug)]
pub struct ConnectivityMonitor {
    name: String,
    config: ProbeConfig,
    state: RwLock<StateData>,
}

impl ConnectivityMonitor {
    pub fn new(name: impl Into<String>, config: ProbeConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(StateData::new()),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectivityState::Connected
    }

    /// Blocking startup probe. Exhausting every attempt is fatal.
    pub async fn initialize(&self, downstream: &dyn Downstream) -> DeliveryResult<()> {
        if self.probe(downstream).await {
            self.mark_connected();
            info!(downstream = %self.name, "Downstream reachable");
            Ok(())
        } else {
            Err(DeliveryError::ProbeExhausted {
                downstream: self.name.clone(),
                attempts: self.config.attempts,
            })
        }
    }

    /// Probe with retries; returns true as soon as one attempt succeeds
    pub async fn probe(&self, downstream: &dyn Downstream) -> bool {
        for attempt in 1..=self.config.attempts {
            match downstream.probe().await {
                Ok(()) => return true,
                Err(e) => {
                    info!(
                        downstream = %self.name,
                        attempt,
                        max_attempts = self.config.attempts,
                        error = %e,
                        "Cannot connect to downstream, retrying in {:?}",
                        self.config.delay()
                    );
                }
            }

            if attempt < self.config.attempts {
                tokio::time::sleep(self.config.delay()).await;
            }
        }

        false
    }

    /// Single best-effort attempt
    pub async fn probe_once(&self, downstream: &dyn Downstream) -> bool {
        match downstream.probe().await {
            Ok(()) => true,
            Err(e) => {
                debug!(downstream = %self.name, error = %e, "Probe failed");
                false
            }
        }
    }

    /// Flip to disconnected; returns the transition when the state changed
    pub fn mark_disconnected(&self, reason: impl Into<String>) -> Option<StateTransition> {
        let transition = self
            .state
            .write()
            .transition_to(ConnectivityState::Disconnected, reason.into());

        if let Some(ref t) = transition {
            warn!(
                downstream = %self.name,
                from = %t.from,
                to = %t.to,
                reason = %t.reason,
                "Lost connection to downstream"
            );
        }

        transition
    }

    /// Flip to connected; returns the transition when the state changed
    pub fn mark_connected(&self) -> Option<StateTransition> {
        let transition = self
            .state
            .write()
            .transition_to(ConnectivityState::Connected, "Probe succeeded".to_string());

        if let Some(ref t) = transition {
            info!(
                downstream = %self.name,
                from = %t.from,
                to = %t.to,
                "Downstream is back online"
            );
        }

        transition
    }

    pub fn stats(&self) -> ConnectivityStats {
        let state = self.state.read();
        ConnectivityStats {
            downstream: self.name.clone(),
            state: state.state,
            last_state_change: state.last_state_change,
            disconnected_at: state.disconnected_at,
            transition_count: state.transition_count,
        }
    }
}
