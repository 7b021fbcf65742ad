//! Health reporting for the cache and sync services.

use crate::cache::{CacheService, ConnectionHealth, HealthEvent};
use crate::metrics::CacheMetrics;
use crate::sync::{SyncMetricsSnapshot, SyncService};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Overall subsystem status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Cache connected, no recent durable failures
    Healthy,
    /// Serving, but something needs attention
    Degraded,
    /// Cache unreachable
    Unhealthy,
}

/// Combined health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Cache connection health
    pub cache: ConnectionHealth,
    /// Durable sync counters
    pub sync: SyncMetricsSnapshot,
    /// Queued eventual cache writes
    pub pending_writes: usize,
}

/// Reads health from the services it is given.
#[derive(Debug, Clone)]
pub struct SyncMonitor {
    cache: Arc<CacheService>,
    sync: Arc<SyncService>,
}

impl SyncMonitor {
    /// Create a monitor over the given services.
    #[must_use]
    pub const fn new(cache: Arc<CacheService>, sync: Arc<SyncService>) -> Self {
        Self { cache, sync }
    }

    /// Current health.
    ///
    /// `Unhealthy` when the cache is disconnected; `Degraded` when the cache
    /// is recovering from failures or durable writes have failed.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let cache = self.cache.health();
        let sync = self.sync.metrics();

        let status = if !cache.connected {
            HealthStatus::Unhealthy
        } else if cache.consecutive_failures > 0 || sync.batch_failures > 0 || sync.single_failures > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            cache,
            sync,
            pending_writes: self.cache.pending_writes(),
        }
    }

    /// Log every health transition and mirror connectivity into the
    /// `chatsync_cache_connected` gauge until `shutdown` fires.
    #[must_use]
    pub fn spawn_event_logger(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.cache.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => log_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Health event logger lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn log_event(event: &HealthEvent) {
    match event {
        HealthEvent::Connected => {
            CacheMetrics::record_connected(true);
            tracing::info!("Cache connected");
        }
        HealthEvent::Disconnected { error } => {
            CacheMetrics::record_connected(false);
            tracing::warn!(error = %error, "Cache disconnected");
        }
        HealthEvent::Reconnected { attempts } => {
            CacheMetrics::record_connected(true);
            tracing::info!(attempts, "Cache reconnected");
        }
        HealthEvent::MaxReconnectAttempts { attempts } => {
            CacheMetrics::record_connected(false);
            tracing::error!(attempts, "Cache reconnection gave up");
        }
    }
}
