//! Prometheus metrics for the session cache.
//!
//! Covers:
//! - Cache operations, corruption skips and the eventual-write queue
//! - Session appends, evictions and degraded write-through
//! - Durable sync throughput and failures
//! - Background worker sweeps
//! - Retries
//!
//! # Example
//!
//! ```rust,no_run
//! use chatsync_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves the scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the recorder and spawn the HTTP exporter.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or bound,
    /// and [`MetricsError::Install`] if another recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(_e) = exporter.await {
                // ExporterError implements neither Display nor Debug, so it cannot be logged.
                tracing::error!("Metrics exporter stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Cache
    describe_counter!("chatsync_cache_operations_total", "Cache store calls by operation and outcome");
    describe_counter!(
        "chatsync_cache_corrupt_records_total",
        "Malformed cache records skipped while loading sessions"
    );
    describe_histogram!("chatsync_cache_operation_duration_seconds", "Cache store call latency");
    describe_gauge!("chatsync_cache_connected", "Cache connectivity (1=connected, 0=disconnected)");
    describe_counter!("chatsync_cache_reconnects_total", "Cache reconnection attempts");
    describe_gauge!("chatsync_write_queue_depth", "Eventual writes waiting to be flushed");
    describe_counter!("chatsync_write_queue_flushed_total", "Eventual writes flushed to the cache");
    describe_counter!("chatsync_write_queue_flush_failures_total", "Failed eventual-write flushes");

    // Sessions
    describe_counter!("chatsync_messages_appended_total", "Messages appended, by write mode");
    describe_counter!("chatsync_messages_evicted_total", "Messages evicted from full sessions");
    describe_counter!("chatsync_sessions_created_total", "Sessions created, by origin");
    describe_counter!("chatsync_sessions_expired_total", "Sessions flushed and removed from the cache");

    // Sync
    describe_counter!("chatsync_messages_synced_total", "Messages confirmed durable");
    describe_counter!("chatsync_sync_batches_total", "Durable write chunks by outcome");
    describe_counter!("chatsync_sync_single_failures_total", "Single-message durable writes that failed");
    describe_histogram!("chatsync_sync_batch_duration_seconds", "Time taken to write one batch");

    // Worker
    describe_counter!("chatsync_worker_sweeps_total", "Background worker sweeps");
    describe_counter!("chatsync_worker_session_failures_total", "Per-session worker failures");
    describe_histogram!("chatsync_worker_sweep_duration_seconds", "Time taken by one worker sweep");

    // Retry
    describe_counter!("chatsync_retries_total", "Retries scheduled, by operation");
    describe_counter!("chatsync_retries_exhausted_total", "Operations that exhausted their attempts");
}

/// Cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record one logical cache operation.
    pub fn record_operation(operation: &'static str, ok: bool, duration: Duration) {
        let outcome = if ok { "ok" } else { "error" };
        counter!("chatsync_cache_operations_total", "operation" => operation, "outcome" => outcome)
            .increment(1);
        histogram!("chatsync_cache_operation_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }

    /// Record a skipped malformed record.
    pub fn record_corruption() {
        counter!("chatsync_cache_corrupt_records_total").increment(1);
    }

    /// Record connectivity.
    pub fn record_connected(connected: bool) {
        gauge!("chatsync_cache_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Record a reconnection attempt.
    pub fn record_reconnect_attempt() {
        counter!("chatsync_cache_reconnects_total").increment(1);
    }

    /// Record the write queue depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_queue_depth(depth: usize) {
        gauge!("chatsync_write_queue_depth").set(depth as f64);
    }

    /// Record a successful queue flush.
    pub fn record_flush(count: usize) {
        counter!("chatsync_write_queue_flushed_total").increment(count as u64);
    }

    /// Record a failed queue flush.
    pub fn record_flush_failure() {
        counter!("chatsync_write_queue_flush_failures_total").increment(1);
    }
}

/// Session metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record an accepted append.
    pub fn record_append(mode: &'static str) {
        counter!("chatsync_messages_appended_total", "mode" => mode).increment(1);
    }

    /// Record evicted messages.
    pub fn record_evictions(count: usize) {
        counter!("chatsync_messages_evicted_total").increment(count as u64);
    }

    /// Record a new session.
    pub fn record_created(origin: &'static str) {
        counter!("chatsync_sessions_created_total", "origin" => origin).increment(1);
    }

    /// Record a session removed after a full flush.
    pub fn record_expired() {
        counter!("chatsync_sessions_expired_total").increment(1);
    }
}

/// Sync metrics recorder.
pub struct SyncMetrics;

impl SyncMetrics {
    /// Record a written chunk.
    pub fn record_batch(count: usize, duration: Duration) {
        counter!("chatsync_messages_synced_total").increment(count as u64);
        counter!("chatsync_sync_batches_total", "outcome" => "ok").increment(1);
        histogram!("chatsync_sync_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a chunk that exhausted its retries.
    pub fn record_batch_failure() {
        counter!("chatsync_sync_batches_total", "outcome" => "error").increment(1);
    }

    /// Record a single-message write.
    pub fn record_single(ok: bool) {
        if ok {
            counter!("chatsync_messages_synced_total").increment(1);
        } else {
            counter!("chatsync_sync_single_failures_total").increment(1);
        }
    }
}

/// Worker metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a completed sweep.
    pub fn record_sweep(duration: Duration) {
        counter!("chatsync_worker_sweeps_total").increment(1);
        histogram!("chatsync_worker_sweep_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a per-session failure.
    pub fn record_session_failure(stage: &'static str) {
        counter!("chatsync_worker_session_failures_total", "stage" => stage).increment(1);
    }
}
