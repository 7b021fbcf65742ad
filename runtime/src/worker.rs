//! Background sync worker.
//!
//! Every `worker_interval` the worker sweeps the cache:
//!
//! 1. **Expiring sessions** (inside the lookahead window, with unsynced
//!    messages): `mark_syncing` → `sync_session_to_db` →
//!    `mark_messages_synced` → `expire_session`, one session at a time per
//!    chat, up to `worker_concurrency` chats at once.
//! 2. **High-water sessions** (at or above the proactive flush threshold):
//!    `perform_background_sync`.
//!
//! A failure on one session is logged and counted; it never stops the sweep.
//! On shutdown the worker can flush and expire every session and drain the
//! cache write queue.

use crate::cache::CacheService;
use crate::error::SessionError;
use crate::metrics::WorkerMetrics;
use crate::session::SessionManager;
use crate::sync::SyncService;
use chatsync_core::SyncConfig;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expiring sessions flushed and removed
    pub expired: usize,
    /// Expiring sessions that failed at some stage
    pub expire_failures: usize,
    /// High-water sessions partially flushed
    pub background_synced: usize,
    /// High-water sessions whose flush failed
    pub background_failures: usize,
    /// Messages made durable by this sweep
    pub messages_synced: usize,
}

impl SweepReport {
    /// Whether the sweep touched anything.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.expired == 0
            && self.expire_failures == 0
            && self.background_synced == 0
            && self.background_failures == 0
    }
}

/// Result of [`BackgroundSyncWorker::expire_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpireAllReport {
    /// Sessions flushed and removed
    pub expired: usize,
    /// Sessions left in place because their flush failed
    pub failures: usize,
    /// Messages made durable
    pub messages_synced: usize,
}

/// Periodic flusher for expiring and oversized sessions.
pub struct BackgroundSyncWorker {
    manager: Arc<SessionManager>,
    sync: Arc<SyncService>,
    cache: Arc<CacheService>,
    interval: Duration,
    concurrency: usize,
    flush_on_shutdown: bool,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundSyncWorker {
    /// Create a worker.
    ///
    /// Returns the worker and a shutdown sender. Send `true` to stop it.
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager>,
        sync: Arc<SyncService>,
        cache: Arc<CacheService>,
        config: &SyncConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Self {
            manager,
            sync,
            cache,
            interval: config.worker_interval(),
            concurrency: config.worker_concurrency.max(1),
            flush_on_shutdown: config.flush_on_shutdown,
            shutdown: shutdown_rx,
        };
        (worker, shutdown_tx)
    }

    /// Sweep every interval until shutdown.
    ///
    /// With `flush_on_shutdown` set, every session is flushed and expired and
    /// the cache write queue is drained before returning.
    pub async fn run(&mut self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            concurrency = self.concurrency,
            "Starting background sync worker"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*self.shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    if !report.is_idle() {
                        tracing::info!(
                            expired = report.expired,
                            expire_failures = report.expire_failures,
                            background_synced = report.background_synced,
                            background_failures = report.background_failures,
                            messages_synced = report.messages_synced,
                            "Sweep finished"
                        );
                    }
                }

                result = self.shutdown.changed() => {
                    if result.is_err() || *self.shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        if self.flush_on_shutdown {
            let report = self.expire_all().await;
            tracing::info!(
                expired = report.expired,
                failures = report.failures,
                messages_synced = report.messages_synced,
                "Flushed sessions on shutdown"
            );
            if let Err(e) = self.cache.flush_pending().await {
                tracing::warn!(error = %e, "Final write queue flush failed");
            }
        }

        tracing::info!("Background sync worker stopped");
    }

    /// Run a single sweep.
    pub async fn run_once(&self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        match self.manager.get_expiring_sessions().await {
            Ok(sessions) => {
                let results: Vec<Result<usize, SessionError>> = futures::stream::iter(sessions)
                    .map(|session| async move { self.flush_and_expire(&session.chat_id).await })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;
                for result in results {
                    match result {
                        Ok(synced) => {
                            report.expired += 1;
                            report.messages_synced += synced;
                        }
                        Err(_) => report.expire_failures += 1,
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list expiring sessions");
                WorkerMetrics::record_session_failure("scan");
            }
        }

        match self.manager.get_active_sessions().await {
            Ok(sessions) => {
                let oversized = sessions
                    .into_iter()
                    .filter(|session| self.manager.is_over_threshold(session));
                let results: Vec<Result<usize, SessionError>> = futures::stream::iter(oversized)
                    .map(|session| async move {
                        self.manager
                            .perform_background_sync(&session.chat_id)
                            .await
                            .map_err(|e| failed(&session.chat_id, "background_sync", e))
                    })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;
                for result in results {
                    match result {
                        Ok(synced) => {
                            report.background_synced += 1;
                            report.messages_synced += synced;
                        }
                        Err(_) => report.background_failures += 1,
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list active sessions");
                WorkerMetrics::record_session_failure("scan");
            }
        }

        let pruned = self.manager.prune_idle_locks();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned idle chat locks");
        }

        WorkerMetrics::record_sweep(started.elapsed());
        report
    }

    /// Flush and expire every active session.
    pub async fn expire_all(&self) -> ExpireAllReport {
        let mut report = ExpireAllReport::default();
        let sessions = match self.manager.get_active_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list sessions for mass expiry");
                return report;
            }
        };

        let results: Vec<_> = futures::stream::iter(sessions)
            .map(|session| async move {
                self.manager
                    .expire_session(&session.chat_id)
                    .await
                    .map_err(|e| failed(&session.chat_id, "expire", e))
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(outcome) => {
                    if outcome.deleted {
                        report.expired += 1;
                    }
                    report.messages_synced += outcome.synced;
                }
                Err(_) => report.failures += 1,
            }
        }
        report
    }

    async fn flush_and_expire(&self, chat_id: &str) -> Result<usize, SessionError> {
        if !self
            .manager
            .mark_syncing(chat_id)
            .await
            .map_err(|e| failed(chat_id, "mark_syncing", e))?
        {
            return Ok(0);
        }

        let Some(session) = self
            .manager
            .get_session(chat_id)
            .await
            .map_err(|e| failed(chat_id, "load", e))?
        else {
            return Ok(0);
        };

        let report = match self.sync.sync_session_to_db(&session).await {
            Ok(report) => report,
            Err(e) => {
                self.manager.hold_for_retry(chat_id).await;
                return Err(failed(chat_id, "sync", e.into()));
            }
        };

        self.manager
            .mark_messages_synced(chat_id, &report.synced_ids)
            .await
            .map_err(|e| failed(chat_id, "mark_synced", e))?;

        let outcome = self
            .manager
            .expire_session(chat_id)
            .await
            .map_err(|e| failed(chat_id, "expire", e))?;

        Ok(report.batch.synced + outcome.synced)
    }
}

fn failed(chat_id: &str, stage: &'static str, error: SessionError) -> SessionError {
    tracing::warn!(chat_id, stage, error = %error, "Session sync failed");
    WorkerMetrics::record_session_failure(stage);
    error
}

impl std::fmt::Debug for BackgroundSyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSyncWorker")
            .field("interval", &self.interval)
            .field("concurrency", &self.concurrency)
            .field("flush_on_shutdown", &self.flush_on_shutdown)
            .finish_non_exhaustive()
    }
}
