//! Cache connection health tracking and typed health events.

use chatsync_core::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Snapshot of the cache connection's health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    /// Whether the last call or ping succeeded
    pub connected: bool,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Failures since startup
    pub total_errors: u64,
    /// Last successful ping
    pub last_ping_at: Option<DateTime<Utc>>,
    /// Most recent failure message
    pub last_error: Option<String>,
    /// Attempts made by the current (or last) reconnection run
    pub reconnect_attempts: u32,
}

/// Connectivity transitions published on the health channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// The cache answered after being down (or for the first time)
    Connected,
    /// The cache stopped answering
    Disconnected {
        /// Failure that caused the transition
        error: String,
    },
    /// A reconnection run succeeded
    Reconnected {
        /// Attempts it took
        attempts: u32,
    },
    /// A reconnection run gave up
    MaxReconnectAttempts {
        /// Attempts made
        attempts: u32,
    },
}

#[derive(Debug, Default)]
struct TrackerState {
    health: ConnectionHealth,
    // Whether any call has completed yet; the first outcome always publishes.
    observed: bool,
}

impl TrackerState {
    fn observe(&mut self, connected: bool) -> bool {
        let changed = !self.observed || self.health.connected != connected;
        self.observed = true;
        self.health.connected = connected;
        changed
    }
}

/// Shared health record plus event fan-out.
#[derive(Debug)]
pub(crate) struct HealthTracker {
    state: Mutex<TrackerState>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthTracker {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub(crate) fn snapshot(&self) -> ConnectionHealth {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .health
            .clone()
    }

    pub(crate) fn record_success(&self, pinged_at: Option<DateTime<Utc>>) {
        let became_connected = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = state.observe(true);
            state.health.consecutive_failures = 0;
            if pinged_at.is_some() {
                state.health.last_ping_at = pinged_at;
            }
            changed
        };
        if became_connected {
            self.publish(HealthEvent::Connected);
        }
    }

    /// Returns the consecutive failure count after recording.
    pub(crate) fn record_failure(&self, error: &str) -> u32 {
        let (failures, became_disconnected) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = state.observe(false);
            let health = &mut state.health;
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.total_errors = health.total_errors.saturating_add(1);
            health.last_error = Some(error.to_string());
            (health.consecutive_failures, changed)
        };
        if became_disconnected {
            self.publish(HealthEvent::Disconnected {
                error: error.to_string(),
            });
        }
        failures
    }

    pub(crate) fn record_reconnect_attempt(&self, attempt: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.health.reconnect_attempts = attempt;
    }

    pub(crate) fn record_reconnected(&self, attempts: u32, at: DateTime<Utc>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.observe(true);
            state.health.consecutive_failures = 0;
            state.health.reconnect_attempts = attempts;
            state.health.last_ping_at = Some(at);
        }
        self.publish(HealthEvent::Reconnected { attempts });
    }

    pub(crate) fn record_gave_up(&self, attempts: u32) {
        self.record_reconnect_attempt(attempts);
        self.publish(HealthEvent::MaxReconnectAttempts { attempts });
    }

    fn publish(&self, event: HealthEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
