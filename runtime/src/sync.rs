//! Sync service: idempotent, batched writes of cached messages to durable storage.
//!
//! # Idempotency
//!
//! The message id is the de-duplication key. Durable stores upsert or no-op
//! on a known id, so a chunk that failed halfway can be retried whole: the
//! already-written messages come back as [`WriteOutcome::Duplicate`].
//!
//! # Batching
//!
//! `batch_sync_messages` splits its input into chunks of `sync_batch_size`.
//! Writes inside a chunk run concurrently. A failing chunk is retried whole
//! with linear backoff; once retries are exhausted the call stops and
//! reports how many messages (always a prefix of the input) are durable.

use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use chatsync_core::{
    ChatMetadataUpdate, ChatSession, Clock, DateTime, DurableStore, DurableStoreError, MessageData,
    MessageQuery, SessionHistoryEntry, SyncConfig, Utc, WriteOutcome,
};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Outcome of [`SyncService::batch_sync_messages`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSyncReport {
    /// Messages confirmed durable (inserted or already present)
    pub synced: usize,
    /// Messages newly written
    pub inserted: usize,
    /// Messages the store already had
    pub duplicates: usize,
    /// Chunks written
    pub chunks: usize,
}

/// Outcome of [`SyncService::sync_session_to_db`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSyncReport {
    /// Ids of the messages that were unsynced and are now durable
    pub synced_ids: Vec<String>,
    /// Batch statistics
    pub batch: BatchSyncReport,
    /// Whether the chat metadata write succeeded
    pub metadata_updated: bool,
    /// Whether the session history write succeeded
    pub history_recorded: bool,
}

/// Point-in-time copy of the sync counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    /// Messages confirmed durable
    pub messages_synced: u64,
    /// Chunks written
    pub batches_synced: u64,
    /// Chunks that exhausted their retries
    pub batch_failures: u64,
    /// Single-message writes that exhausted their retries
    pub single_failures: u64,
    /// Sessions fully flushed
    pub sessions_synced: u64,
    /// Retries scheduled across all writes
    pub retries: u64,
    /// Last successful write
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SyncCounters {
    messages_synced: AtomicU64,
    batches_synced: AtomicU64,
    batch_failures: AtomicU64,
    single_failures: AtomicU64,
    sessions_synced: AtomicU64,
    retries: AtomicU64,
    // Epoch millis; i64::MIN means never.
    last_sync_at: AtomicI64,
}

impl SyncCounters {
    fn new() -> Self {
        Self {
            last_sync_at: AtomicI64::new(i64::MIN),
            ..Self::default()
        }
    }

    fn record_retries(&self, attempts: usize) {
        let retries = u64::try_from(attempts.saturating_sub(1)).unwrap_or(u64::MAX);
        self.retries.fetch_add(retries, Ordering::Relaxed);
    }

    fn record_synced(&self, count: usize, at: DateTime<Utc>) {
        self.messages_synced
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.last_sync_at.store(at.timestamp_millis(), Ordering::Relaxed);
    }
}

/// Writes cached messages to the durable store.
pub struct SyncService {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    batch_size: usize,
    counters: SyncCounters,
}

impl SyncService {
    /// Create a sync service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::builder()
                .max_attempts(config.sync_retry_attempts)
                .base_delay(config.sync_retry_base_delay())
                .build(),
            batch_size: config.sync_batch_size.max(1),
            counters: SyncCounters::new(),
        }
    }

    /// Write one message with retry.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Failed`] once retries are exhausted.
    pub async fn sync_single_message(
        &self,
        chat_id: &str,
        message: &MessageData,
    ) -> Result<WriteOutcome, SyncError> {
        let mut attempts = 0;
        let result = retry_with_backoff(&self.retry, "sync_single_message", || {
            attempts += 1;
            self.store.add_message(chat_id, message)
        })
        .await;
        self.counters.record_retries(attempts);

        match result {
            Ok(outcome) => {
                self.counters.record_synced(1, self.clock.now());
                SyncMetrics::record_single(true);
                tracing::debug!(chat_id, message_id = %message.id, ?outcome, "Message synced");
                Ok(outcome)
            }
            Err(e) => {
                self.counters.single_failures.fetch_add(1, Ordering::Relaxed);
                SyncMetrics::record_single(false);
                tracing::error!(chat_id, message_id = %message.id, attempts, error = %e, "Message sync failed");
                Err(SyncError::Failed {
                    chat_id: chat_id.to_string(),
                    synced: 0,
                    attempts,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Write `messages` in chunks, stopping at the first chunk that exhausts its retries.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Failed`] whose `synced` count is the length of the
    /// durable prefix of `messages`.
    pub async fn batch_sync_messages(
        &self,
        chat_id: &str,
        messages: &[MessageData],
    ) -> Result<BatchSyncReport, SyncError> {
        let mut report = BatchSyncReport::default();

        for chunk in messages.chunks(self.batch_size) {
            let started = Instant::now();
            let mut attempts = 0;
            let result = retry_with_backoff(&self.retry, "batch_sync_messages", || {
                attempts += 1;
                self.write_chunk(chat_id, chunk)
            })
            .await;
            self.counters.record_retries(attempts);

            match result {
                Ok(outcomes) => {
                    let inserted = outcomes.iter().filter(|o| **o == WriteOutcome::Inserted).count();
                    report.inserted += inserted;
                    report.duplicates += outcomes.len() - inserted;
                    report.synced += chunk.len();
                    report.chunks += 1;

                    self.counters.batches_synced.fetch_add(1, Ordering::Relaxed);
                    self.counters.record_synced(chunk.len(), self.clock.now());
                    SyncMetrics::record_batch(chunk.len(), started.elapsed());
                }
                Err(e) => {
                    self.counters.batch_failures.fetch_add(1, Ordering::Relaxed);
                    SyncMetrics::record_batch_failure();
                    tracing::error!(
                        chat_id,
                        synced = report.synced,
                        remaining = messages.len() - report.synced,
                        attempts,
                        error = %e,
                        "Batch sync failed, halting"
                    );
                    return Err(SyncError::Failed {
                        chat_id: chat_id.to_string(),
                        synced: report.synced,
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if report.synced > 0 {
            tracing::debug!(
                chat_id,
                synced = report.synced,
                inserted = report.inserted,
                duplicates = report.duplicates,
                chunks = report.chunks,
                "Batch synced"
            );
        }
        Ok(report)
    }

    /// Flush every unsynced message of `session`, then record chat metadata
    /// and session history.
    ///
    /// Metadata and history writes are best effort: failures are logged and
    /// reported as `false` in the report, never returned.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Failed`] if the message batch fails.
    pub async fn sync_session_to_db(&self, session: &ChatSession) -> Result<SessionSyncReport, SyncError> {
        let unsynced: Vec<MessageData> = session.unsynced_messages().cloned().collect();
        let batch = self.batch_sync_messages(&session.chat_id, &unsynced).await?;
        let now = self.clock.now();
        let participant_count = u32::try_from(session.participants.len()).unwrap_or(u32::MAX);

        let metadata = ChatMetadataUpdate {
            chat_id: session.chat_id.clone(),
            synced_message_count: u64::try_from(batch.inserted).unwrap_or(u64::MAX),
            last_session_id: session.session_id.clone(),
            participant_count,
            last_synced_at: now,
        };
        let metadata_updated = match self.store.update_chat_metadata(metadata).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(chat_id = %session.chat_id, error = %e, "Chat metadata update failed");
                false
            }
        };

        let history = SessionHistoryEntry {
            session_id: session.session_id.clone(),
            chat_id: session.chat_id.clone(),
            message_count: u32::try_from(session.messages.len()).unwrap_or(u32::MAX),
            participant_count,
            started_at: session.created_at,
            ended_at: session.last_activity_at,
            synced_at: now,
        };
        let history_recorded = match self.store.record_session_history(history).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(chat_id = %session.chat_id, error = %e, "Session history write failed");
                false
            }
        };

        self.counters.sessions_synced.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            chat_id = %session.chat_id,
            session_id = %session.session_id,
            synced = batch.synced,
            inserted = batch.inserted,
            "Session synced to durable storage"
        );

        Ok(SessionSyncReport {
            synced_ids: unsynced.into_iter().map(|m| m.id).collect(),
            batch,
            metadata_updated,
            history_recorded,
        })
    }

    /// Read the newest `limit` durable messages of a chat, newest first.
    ///
    /// # Errors
    ///
    /// Returns the store error once retries are exhausted.
    pub async fn load_recent_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageData>, DurableStoreError> {
        retry_with_backoff(&self.retry, "load_recent_messages", || {
            self.store.get_messages(chat_id, MessageQuery::latest(limit))
        })
        .await
    }

    /// Snapshot of the sync counters.
    #[must_use]
    pub fn metrics(&self) -> SyncMetricsSnapshot {
        let c = &self.counters;
        let last = c.last_sync_at.load(Ordering::Relaxed);
        SyncMetricsSnapshot {
            messages_synced: c.messages_synced.load(Ordering::Relaxed),
            batches_synced: c.batches_synced.load(Ordering::Relaxed),
            batch_failures: c.batch_failures.load(Ordering::Relaxed),
            single_failures: c.single_failures.load(Ordering::Relaxed),
            sessions_synced: c.sessions_synced.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            last_sync_at: if last == i64::MIN {
                None
            } else {
                DateTime::from_timestamp_millis(last)
            },
        }
    }

    async fn write_chunk(
        &self,
        chat_id: &str,
        chunk: &[MessageData],
    ) -> Result<Vec<WriteOutcome>, DurableStoreError> {
        join_all(chunk.iter().map(|message| self.store.add_message(chat_id, message)))
            .await
            .into_iter()
            .collect()
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
