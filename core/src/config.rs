//! Subsystem configuration.
//!
//! All knobs are plain numbers. Values come from [`SyncConfig::default`],
//! `with_*` builders, or `CHATSYNC_*` environment variables via
//! [`SyncConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid configuration for {field}: {reason}")]
pub struct ConfigError {
    /// Offending field
    pub field: &'static str,
    /// Why it was rejected
    pub reason: String,
}

/// Tuning knobs for the cache, session manager, sync service and worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sliding session TTL in seconds (default: 3600)
    pub session_ttl_secs: u64,
    /// Extra lifetime given to cache keys beyond the session TTL so the worker
    /// can flush before the store evicts (default: 300)
    pub key_ttl_grace_secs: u64,
    /// Hard cap on messages held per session (default: 1000)
    pub max_messages: usize,
    /// Fraction of `max_messages` that triggers proactive flushing (default: 0.8)
    pub background_sync_threshold: f64,
    /// Messages per durable write chunk (default: 100)
    pub sync_batch_size: usize,
    /// Messages pulled from durable storage on cold start (default: 50)
    pub cold_start_page_size: usize,
    /// Attempts per cache primitive (default: 3)
    pub cache_retry_attempts: usize,
    /// Linear backoff base for cache retries in milliseconds (default: 100)
    pub cache_retry_base_delay_ms: u64,
    /// Attempts per durable write chunk (default: 3)
    pub sync_retry_attempts: usize,
    /// Linear backoff base for durable retries in milliseconds (default: 500)
    pub sync_retry_base_delay_ms: u64,
    /// Background worker polling interval in seconds (default: 30)
    pub worker_interval_secs: u64,
    /// Sessions processed concurrently per sweep (default: 8)
    pub worker_concurrency: usize,
    /// Lookahead window for expiring sessions in seconds (default: 60)
    pub expiry_lookahead_secs: u64,
    /// Queued eventual writes that force a flush (default: 50)
    pub write_batch_size: usize,
    /// Maximum time an eventual write waits in the queue, in milliseconds (default: 100)
    pub write_batch_interval_ms: u64,
    /// Health ping interval in seconds (default: 30)
    pub health_check_interval_secs: u64,
    /// Consecutive failed pings before reconnecting (default: 3)
    pub reconnect_failure_threshold: u32,
    /// Reconnection attempts before giving up (default: 5)
    pub max_reconnect_attempts: u32,
    /// Linear backoff base between reconnection attempts in milliseconds (default: 1000)
    pub reconnect_base_delay_ms: u64,
    /// Approximate cap on each chat's activity stream (default: 1000)
    pub activity_stream_max_len: usize,
    /// Flush and expire every session when the worker shuts down (default: true)
    pub flush_on_shutdown: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 3600,
            key_ttl_grace_secs: 300,
            max_messages: 1000,
            background_sync_threshold: 0.8,
            sync_batch_size: 100,
            cold_start_page_size: 50,
            cache_retry_attempts: 3,
            cache_retry_base_delay_ms: 100,
            sync_retry_attempts: 3,
            sync_retry_base_delay_ms: 500,
            worker_interval_secs: 30,
            worker_concurrency: 8,
            expiry_lookahead_secs: 60,
            write_batch_size: 50,
            write_batch_interval_ms: 100,
            health_check_interval_secs: 30,
            reconnect_failure_threshold: 3,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            activity_stream_max_len: 1000,
            flush_on_shutdown: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `CHATSYNC_*` environment variables.
    ///
    /// Unset or unparseable variables fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            session_ttl_secs: env_or("CHATSYNC_SESSION_TTL_SECS", d.session_ttl_secs),
            key_ttl_grace_secs: env_or("CHATSYNC_KEY_TTL_GRACE_SECS", d.key_ttl_grace_secs),
            max_messages: env_or("CHATSYNC_MAX_MESSAGES", d.max_messages),
            background_sync_threshold: env_or(
                "CHATSYNC_BACKGROUND_SYNC_THRESHOLD",
                d.background_sync_threshold,
            ),
            sync_batch_size: env_or("CHATSYNC_SYNC_BATCH_SIZE", d.sync_batch_size),
            cold_start_page_size: env_or("CHATSYNC_COLD_START_PAGE_SIZE", d.cold_start_page_size),
            cache_retry_attempts: env_or("CHATSYNC_CACHE_RETRY_ATTEMPTS", d.cache_retry_attempts),
            cache_retry_base_delay_ms: env_or(
                "CHATSYNC_CACHE_RETRY_BASE_DELAY_MS",
                d.cache_retry_base_delay_ms,
            ),
            sync_retry_attempts: env_or("CHATSYNC_SYNC_RETRY_ATTEMPTS", d.sync_retry_attempts),
            sync_retry_base_delay_ms: env_or(
                "CHATSYNC_SYNC_RETRY_BASE_DELAY_MS",
                d.sync_retry_base_delay_ms,
            ),
            worker_interval_secs: env_or("CHATSYNC_WORKER_INTERVAL_SECS", d.worker_interval_secs),
            worker_concurrency: env_or("CHATSYNC_WORKER_CONCURRENCY", d.worker_concurrency),
            expiry_lookahead_secs: env_or("CHATSYNC_EXPIRY_LOOKAHEAD_SECS", d.expiry_lookahead_secs),
            write_batch_size: env_or("CHATSYNC_WRITE_BATCH_SIZE", d.write_batch_size),
            write_batch_interval_ms: env_or(
                "CHATSYNC_WRITE_BATCH_INTERVAL_MS",
                d.write_batch_interval_ms,
            ),
            health_check_interval_secs: env_or(
                "CHATSYNC_HEALTH_CHECK_INTERVAL_SECS",
                d.health_check_interval_secs,
            ),
            reconnect_failure_threshold: env_or(
                "CHATSYNC_RECONNECT_FAILURE_THRESHOLD",
                d.reconnect_failure_threshold,
            ),
            max_reconnect_attempts: env_or(
                "CHATSYNC_MAX_RECONNECT_ATTEMPTS",
                d.max_reconnect_attempts,
            ),
            reconnect_base_delay_ms: env_or(
                "CHATSYNC_RECONNECT_BASE_DELAY_MS",
                d.reconnect_base_delay_ms,
            ),
            activity_stream_max_len: env_or(
                "CHATSYNC_ACTIVITY_STREAM_MAX_LEN",
                d.activity_stream_max_len,
            ),
            flush_on_shutdown: env_or("CHATSYNC_FLUSH_ON_SHUTDOWN", d.flush_on_shutdown),
        }
    }

    /// Reject values the subsystem cannot honor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_ttl_secs == 0 {
            return Err(invalid("session_ttl_secs", "must be positive"));
        }
        if self.max_messages < 2 {
            return Err(invalid("max_messages", "must be at least 2"));
        }
        if !(self.background_sync_threshold > 0.0 && self.background_sync_threshold <= 1.0) {
            return Err(invalid("background_sync_threshold", "must be in (0, 1]"));
        }
        if self.sync_batch_size == 0 {
            return Err(invalid("sync_batch_size", "must be positive"));
        }
        if self.write_batch_size == 0 {
            return Err(invalid("write_batch_size", "must be positive"));
        }
        if self.cache_retry_attempts == 0 || self.sync_retry_attempts == 0 {
            return Err(invalid("retry_attempts", "at least one attempt is required"));
        }
        if self.worker_concurrency == 0 {
            return Err(invalid("worker_concurrency", "must be positive"));
        }
        if self.worker_interval_secs >= self.expiry_lookahead_secs + self.key_ttl_grace_secs {
            return Err(invalid(
                "worker_interval_secs",
                "must be shorter than expiry_lookahead_secs + key_ttl_grace_secs",
            ));
        }
        Ok(())
    }

    /// Set the sliding session TTL.
    #[must_use]
    pub const fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the per-session message cap.
    #[must_use]
    pub const fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Set the proactive flush fraction.
    #[must_use]
    pub const fn with_background_sync_threshold(mut self, threshold: f64) -> Self {
        self.background_sync_threshold = threshold;
        self
    }

    /// Set the durable write chunk size.
    #[must_use]
    pub const fn with_sync_batch_size(mut self, size: usize) -> Self {
        self.sync_batch_size = size;
        self
    }

    /// Set the cold start page size.
    #[must_use]
    pub const fn with_cold_start_page_size(mut self, size: usize) -> Self {
        self.cold_start_page_size = size;
        self
    }

    /// Set cache retry attempts and linear backoff base.
    #[must_use]
    pub const fn with_cache_retry(mut self, attempts: usize, base_delay: Duration) -> Self {
        self.cache_retry_attempts = attempts;
        self.cache_retry_base_delay_ms = millis(base_delay);
        self
    }

    /// Set durable retry attempts and linear backoff base.
    #[must_use]
    pub const fn with_sync_retry(mut self, attempts: usize, base_delay: Duration) -> Self {
        self.sync_retry_attempts = attempts;
        self.sync_retry_base_delay_ms = millis(base_delay);
        self
    }

    /// Set the worker polling interval.
    #[must_use]
    pub const fn with_worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval_secs = interval.as_secs();
        self
    }

    /// Set the expiring-session lookahead window.
    #[must_use]
    pub const fn with_expiry_lookahead(mut self, window: Duration) -> Self {
        self.expiry_lookahead_secs = window.as_secs();
        self
    }

    /// Set eventual write batching thresholds.
    #[must_use]
    pub const fn with_write_batching(mut self, size: usize, interval: Duration) -> Self {
        self.write_batch_size = size;
        self.write_batch_interval_ms = millis(interval);
        self
    }

    /// Set health check and reconnection parameters.
    #[must_use]
    pub const fn with_reconnect(
        mut self,
        failure_threshold: u32,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        self.reconnect_failure_threshold = failure_threshold;
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_delay_ms = millis(base_delay);
        self
    }

    /// Set whether the worker flushes everything on shutdown.
    #[must_use]
    pub const fn with_flush_on_shutdown(mut self, flush: bool) -> Self {
        self.flush_on_shutdown = flush;
        self
    }

    /// Sliding session TTL.
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Sliding session TTL as a calendar duration.
    #[must_use]
    pub fn session_ttl_delta(&self) -> chrono::Duration {
        to_delta(self.session_ttl())
    }

    /// TTL applied to cache keys: session TTL plus grace.
    #[must_use]
    pub const fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.saturating_add(self.key_ttl_grace_secs))
    }

    /// Message count at which proactive flushing starts.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn background_sync_trigger(&self) -> usize {
        let trigger = (self.max_messages as f64 * self.background_sync_threshold).ceil() as usize;
        trigger.clamp(1, self.max_messages)
    }

    /// Worker polling interval.
    #[must_use]
    pub const fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_secs)
    }

    /// Expiring-session lookahead window as a calendar duration.
    #[must_use]
    pub fn expiry_lookahead(&self) -> chrono::Duration {
        to_delta(Duration::from_secs(self.expiry_lookahead_secs))
    }

    /// Cache retry backoff base.
    #[must_use]
    pub const fn cache_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.cache_retry_base_delay_ms)
    }

    /// Durable retry backoff base.
    #[must_use]
    pub const fn sync_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.sync_retry_base_delay_ms)
    }

    /// Maximum queue wait for eventual writes.
    #[must_use]
    pub const fn write_batch_interval(&self) -> Duration {
        Duration::from_millis(self.write_batch_interval_ms)
    }

    /// Health ping interval.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Reconnection backoff base.
    #[must_use]
    pub const fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError {
        field,
        reason: reason.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
