//! Cache service: sessions, presence and activity over a [`CacheStore`].
//!
//! The service owns three concerns on top of the raw store:
//!
//! - **Encoding**: the key layout and value formats in [`codec`]
//! - **Resilience**: every primitive runs in a bounded retry loop; exhausted
//!   retries surface as [`CacheError::Unavailable`] and count against the
//!   connection health record
//! - **Batching**: presence and activity writes are queued and flushed in one
//!   pipeline when the queue fills up or the flush interval elapses
//!
//! Session writes are never batched: `set_session` and `append_message` each
//! run as one atomic pipeline and either fully apply or return an error.

pub mod codec;
mod batch;
mod health;

pub use health::{ConnectionHealth, HealthEvent};

use crate::metrics::CacheMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use batch::WriteQueue;
use chatsync_core::{
    ActivityEvent, CacheCommand, CacheError, CacheResult, CacheStore, ChatSession, Clock,
    DateTime, MessageData, SessionStatus, SyncConfig, SystemClock, Utc,
};
use codec::{
    SESSION_KEY_PATTERN, activity_key, chat_id_from_session_key, decode_activity, decode_message,
    decode_metadata, encode_message, encode_messages, encode_metadata, expiry_fields, messages_key,
    presence_key, session_key,
};
use futures::StreamExt;
use health::HealthTracker;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Upper bound on queued eventual writes during an outage.
const MAX_PENDING_WRITES: usize = 10_000;

/// Sessions loaded concurrently by [`CacheService::get_all_active_sessions`].
const SCAN_LOAD_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy)]
struct ReconnectPolicy {
    failure_threshold: u32,
    max_attempts: u32,
    base_delay: Duration,
}

/// Cache-backed session storage with retry, health tracking and write batching.
pub struct CacheService {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    reconnect_policy: ReconnectPolicy,
    key_ttl: Duration,
    activity_max_len: usize,
    flush_interval: Duration,
    health_interval: Duration,
    health: HealthTracker,
    queue: WriteQueue,
    reconnecting: Mutex<()>,
}

impl CacheService {
    /// Create a cache service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::builder()
                .max_attempts(config.cache_retry_attempts)
                .base_delay(config.cache_retry_base_delay())
                .build(),
            reconnect_policy: ReconnectPolicy {
                failure_threshold: config.reconnect_failure_threshold.max(1),
                max_attempts: config.max_reconnect_attempts,
                base_delay: config.reconnect_base_delay(),
            },
            key_ttl: config.key_ttl(),
            activity_max_len: config.activity_stream_max_len,
            flush_interval: config.write_batch_interval(),
            health_interval: config.health_check_interval(),
            health: HealthTracker::new(),
            queue: WriteQueue::new(config.write_batch_size, MAX_PENDING_WRITES),
            reconnecting: Mutex::new(()),
        }
    }

    /// Use `clock` for presence timestamps and ping times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verify connectivity once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the store never answers.
    pub async fn initialize(&self) -> CacheResult<()> {
        self.call("initialize", || self.store.ping()).await?;
        self.health.record_success(Some(self.clock.now()));
        tracing::info!("Cache service connected");
        Ok(())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Overwrite the whole session (metadata hash and message list) atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries, or
    /// [`CacheError::Serialization`] if the session cannot be encoded.
    pub async fn set_session(&self, session: &ChatSession) -> CacheResult<()> {
        let meta_key = session_key(&session.chat_id);
        let list_key = messages_key(&session.chat_id);

        let mut commands = vec![
            CacheCommand::Delete {
                keys: vec![meta_key.clone(), list_key.clone()],
            },
            CacheCommand::HashSet {
                key: meta_key.clone(),
                fields: encode_metadata(session)?,
            },
        ];
        if !session.messages.is_empty() {
            commands.push(CacheCommand::ListPush {
                key: list_key.clone(),
                values: encode_messages(&session.messages)?,
            });
        }
        commands.extend(self.expire_commands([meta_key, list_key]));

        self.call("set_session", || self.store.pipeline(commands.clone(), true))
            .await?;

        tracing::debug!(
            chat_id = %session.chat_id,
            session_id = %session.session_id,
            messages = session.messages.len(),
            "Session stored"
        );
        Ok(())
    }

    /// Load a session.
    ///
    /// Returns `None` on a clean miss or when the metadata hash is malformed
    /// (logged, so the caller rebuilds). Malformed message elements are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn get_session(&self, chat_id: &str) -> CacheResult<Option<ChatSession>> {
        let meta_key = session_key(chat_id);
        let fields = self
            .call("get_session", || self.store.hash_get_all(&meta_key))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut session = match decode_metadata(&meta_key, &fields) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "Discarding corrupt session metadata");
                CacheMetrics::record_corruption();
                return Ok(None);
            }
        };

        let list_key = messages_key(chat_id);
        let raw = self
            .call("get_session", || self.store.list_range(&list_key, 0, -1))
            .await?;

        session.messages.reserve(raw.len());
        for element in &raw {
            match decode_message(&list_key, element) {
                Ok(message) => session.messages.push(message),
                Err(e) => {
                    tracing::warn!(chat_id, error = %e, "Skipping corrupt cached message");
                    CacheMetrics::record_corruption();
                }
            }
        }
        session.sort_messages();

        Ok(Some(session))
    }

    /// Fast-path append: write the session's metadata fields and right-push
    /// `message`, refreshing TTLs, in one atomic pipeline.
    ///
    /// `session` must already contain `message` as its last element.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn append_message(&self, session: &ChatSession, message: &MessageData) -> CacheResult<()> {
        let meta_key = session_key(&session.chat_id);
        let list_key = messages_key(&session.chat_id);

        let mut commands = vec![
            CacheCommand::HashSet {
                key: meta_key.clone(),
                fields: encode_metadata(session)?,
            },
            CacheCommand::ListPush {
                key: list_key.clone(),
                values: vec![encode_message(message)?],
            },
        ];
        commands.extend(self.expire_commands([meta_key, list_key]));

        self.call("append_message", || self.store.pipeline(commands.clone(), true))
            .await
    }

    /// Slide a session's expiry without touching its messages.
    ///
    /// The hash is only updated if it still exists, so a key that expires
    /// mid-refresh is never recreated with partial fields.
    ///
    /// Returns `false` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn refresh_expiry(
        &self,
        chat_id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<bool> {
        let meta_key = session_key(chat_id);
        let fields = expiry_fields(last_activity_at, expires_at);
        let exists = self
            .call("refresh_expiry", || {
                self.store.hash_update(&meta_key, fields.clone(), Some(self.key_ttl))
            })
            .await?;
        if !exists {
            return Ok(false);
        }

        let list_key = messages_key(chat_id);
        self.call("refresh_expiry", || self.store.expire(&list_key, self.key_ttl))
            .await?;
        Ok(true)
    }

    /// Push back the cache-side deadline of a session's keys, leaving its
    /// fields (and so its logical `expires_at`) unchanged.
    ///
    /// Used when an expiry flush fails: the session stays due for expiry but
    /// its keys outlive the outage.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn retain_keys(&self, chat_id: &str) -> CacheResult<()> {
        let commands: Vec<CacheCommand> = self
            .expire_commands([session_key(chat_id), messages_key(chat_id)])
            .collect();
        self.call("retain_keys", || self.store.pipeline(commands.clone(), true))
            .await
    }

    /// Update only the status field of an existing session.
    ///
    /// Returns `false` if the session does not exist; nothing is written then.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn set_status(&self, chat_id: &str, status: SessionStatus) -> CacheResult<bool> {
        let fields = vec![("status".to_string(), status.as_str().to_string())];
        let meta_key = session_key(chat_id);
        self.call("set_status", || self.store.hash_update(&meta_key, fields.clone(), None))
            .await
    }

    /// Remove a session's metadata, messages and presence.
    ///
    /// Returns whether anything existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn delete_session(&self, chat_id: &str) -> CacheResult<bool> {
        let keys = vec![session_key(chat_id), messages_key(chat_id), presence_key(chat_id)];
        let removed = self
            .call("delete_session", || self.store.delete(keys.clone()))
            .await?;
        tracing::debug!(chat_id, removed, "Session deleted");
        Ok(removed > 0)
    }

    /// Load every session in the cache that is not `Expired`.
    ///
    /// Sessions that fail to load are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the key scan itself fails.
    pub async fn get_all_active_sessions(&self) -> CacheResult<Vec<ChatSession>> {
        let keys = self
            .call("scan_sessions", || self.store.scan_keys(SESSION_KEY_PATTERN))
            .await?;

        let chat_ids: Vec<String> = keys
            .iter()
            .filter_map(|key| chat_id_from_session_key(key))
            .map(str::to_string)
            .collect();

        let mut sessions: Vec<ChatSession> = futures::stream::iter(chat_ids)
            .map(|chat_id| async move {
                match self.get_session(&chat_id).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(chat_id = %chat_id, error = %e, "Skipping session that failed to load");
                        None
                    }
                }
            })
            .buffer_unordered(SCAN_LOAD_CONCURRENCY)
            .filter_map(|session| async move { session.filter(ChatSession::is_active) })
            .collect()
            .await;

        sessions.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));
        Ok(sessions)
    }

    // ========================================================================
    // Batched (eventual) writes
    // ========================================================================

    /// Queue a presence heartbeat for `user_id`.
    pub fn update_presence(&self, chat_id: &str, user_id: &str) {
        let key = presence_key(chat_id);
        let seen = self.clock.now().timestamp_millis().to_string();
        self.enqueue([
            CacheCommand::HashSet {
                key: key.clone(),
                fields: vec![(user_id.to_string(), seen)],
            },
            CacheCommand::Expire { key, ttl: self.key_ttl },
        ]);
    }

    /// Queue an activity event.
    pub fn record_activity(&self, event: &ActivityEvent) {
        let key = activity_key(&event.chat_id);
        self.enqueue([
            CacheCommand::StreamAppend {
                key: key.clone(),
                fields: codec::activity_fields(event),
                max_len: Some(self.activity_max_len),
            },
            CacheCommand::Expire { key, ttl: self.key_ttl },
        ]);
    }

    /// Send every queued write now.
    ///
    /// Returns the number of commands flushed. On failure the batch is put
    /// back at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn flush_pending(&self) -> CacheResult<usize> {
        let batch = self.queue.drain();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        let result = self
            .call("flush_pending", || self.store.pipeline(batch.clone(), false))
            .await;
        match result {
            Ok(()) => {
                CacheMetrics::record_flush(count);
                CacheMetrics::record_queue_depth(self.queue.len());
                tracing::debug!(count, "Flushed queued cache writes");
                Ok(count)
            }
            Err(e) => {
                CacheMetrics::record_flush_failure();
                let dropped = self.queue.requeue_front(batch);
                if dropped > 0 {
                    tracing::warn!(dropped, "Write queue full, dropped oldest queued writes");
                }
                tracing::warn!(count, error = %e, "Flush failed, batch re-queued");
                Err(e)
            }
        }
    }

    /// Number of queued eventual writes.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    /// Newest `count` activity events for a chat, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] after retries.
    pub async fn recent_activity(&self, chat_id: &str, count: usize) -> CacheResult<Vec<ActivityEvent>> {
        let key = activity_key(chat_id);
        let entries = self
            .call("recent_activity", || self.store.stream_range(&key, count))
            .await?;
        Ok(entries
            .iter()
            .filter_map(|entry| decode_activity(chat_id, entry))
            .collect())
    }

    /// Flush the write queue whenever it fills up or the interval elapses.
    ///
    /// Performs a final flush when `shutdown` fires.
    pub fn spawn_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = self.queue.wait_full() => {}
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if let Err(e) = self.flush_pending().await {
                    tracing::warn!(error = %e, "Background flush failed");
                }
            }

            if let Err(e) = self.flush_pending().await {
                tracing::warn!(error = %e, "Final flush failed");
            }
            tracing::info!("Write queue flush loop stopped");
        })
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Current connection health.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        self.health.snapshot()
    }

    /// Subscribe to connectivity transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.health.subscribe()
    }

    /// Ping once and update the health record.
    ///
    /// After `reconnect_failure_threshold` consecutive failures the
    /// reconnection routine runs before returning.
    pub async fn check_health(&self) -> ConnectionHealth {
        match self.store.ping().await {
            Ok(()) => self.health.record_success(Some(self.clock.now())),
            Err(e) => {
                let failures = self.health.record_failure(&e.to_string());
                tracing::warn!(failures, error = %e, "Cache health check failed");
                if failures >= self.reconnect_policy.failure_threshold {
                    self.reconnect().await;
                }
            }
        }
        CacheMetrics::record_connected(self.health.snapshot().connected);
        self.health()
    }

    /// Re-establish the store connection with bounded, linearly backed-off attempts.
    ///
    /// Publishes [`HealthEvent::Reconnected`] or
    /// [`HealthEvent::MaxReconnectAttempts`]. Concurrent callers wait for the
    /// run in progress and then start their own.
    pub async fn reconnect(&self) -> bool {
        let _running = self.reconnecting.lock().await;
        let policy = self.reconnect_policy;

        for attempt in 1..=policy.max_attempts {
            self.health.record_reconnect_attempt(attempt);
            CacheMetrics::record_reconnect_attempt();

            let result = match self.store.reconnect().await {
                Ok(()) => self.store.ping().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.health.record_reconnected(attempt, self.clock.now());
                    tracing::info!(attempt, "Reconnected to cache");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = policy.max_attempts, error = %e, "Reconnect attempt failed");
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.base_delay.saturating_mul(attempt)).await;
                    }
                }
            }
        }

        self.health.record_gave_up(policy.max_attempts);
        tracing::error!(attempts = policy.max_attempts, "Giving up on cache reconnection");
        false
    }

    /// Ping every `health_check_interval` until `shutdown` fires.
    pub fn spawn_health_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_health().await;
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Cache health monitor stopped");
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn expire_commands<const N: usize>(&self, keys: [String; N]) -> impl Iterator<Item = CacheCommand> + '_ {
        keys.into_iter()
            .map(|key| CacheCommand::Expire { key, ttl: self.key_ttl })
    }

    fn enqueue<const N: usize>(&self, commands: [CacheCommand; N]) {
        let dropped = self.queue.push(commands);
        if dropped > 0 {
            tracing::warn!(dropped, "Write queue full, dropped oldest queued writes");
        }
        CacheMetrics::record_queue_depth(self.queue.len());
    }

    /// Run one store primitive with retry, metrics and health accounting.
    async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> CacheResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let started = Instant::now();
        let mut attempts = 0;
        let result = retry_with_predicate(
            &self.retry,
            operation,
            || {
                attempts += 1;
                op()
            },
            CacheError::is_retryable,
        )
        .await;
        CacheMetrics::record_operation(operation, result.is_ok(), started.elapsed());

        match result {
            Ok(value) => {
                self.health.record_success(None);
                Ok(value)
            }
            Err(e) if e.is_retryable() => {
                let reason = match e {
                    CacheError::Backend(reason) => reason,
                    other => other.to_string(),
                };
                self.health.record_failure(&reason);
                Err(CacheError::Unavailable {
                    operation: operation.to_string(),
                    attempts,
                    reason,
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("key_ttl", &self.key_ttl)
            .field("retry", &self.retry)
            .field("pending_writes", &self.queue.len())
            .finish_non_exhaustive()
    }
}
