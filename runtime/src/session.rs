//! Session manager: the append path and session lifecycle.
//!
//! # Append
//!
//! ```text
//! lock(chat) ─► cache hit? ─► cold start? ─► fresh
//!            ─► de-dup by id
//!            ─► at cap? sync oldest (if unsynced) and evict
//!            ─► push, slide expiry
//!            ─► fast-path append | whole-session write
//!            ─► queue presence + activity
//! ```
//!
//! If the cache is unavailable the message is written through to durable
//! storage and the outcome reports [`AppendMode::WriteThrough`].
//!
//! # Concurrency
//!
//! Every read-modify-write on a chat runs under that chat's in-process mutex.
//! The lock is held across I/O only for one chat's append (which blocks on
//! at most one single-message sync) and for its expiry flush. Background
//! sync releases it while the batch is written.

use crate::cache::CacheService;
use crate::error::{SessionError, SessionResult};
use crate::locks::ChatLocks;
use crate::metrics::SessionMetrics;
use crate::sync::SyncService;
use chatsync_core::{
    ActivityEvent, ActivityKind, CacheError, ChatSession, Clock, DateTime, DurableStoreError,
    MessageData, NewMessage, SessionStatus, SyncConfig, Utc, compare_messages,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// How an accepted message was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendMode {
    /// Written to the cached session; durable write pending
    Cached,
    /// Cache unavailable; written straight to durable storage
    WriteThrough,
}

impl AppendMode {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::WriteThrough => "write_through",
        }
    }
}

/// Result of [`SessionManager::add_message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    /// Session holding the message (`None` in write-through mode)
    pub session_id: Option<String>,
    /// Id of the appended (or already present) message
    pub message_id: String,
    /// Messages in the session after the append
    pub message_count: usize,
    /// Ids evicted to stay within the cap (all durable)
    pub evicted: Vec<String>,
    /// Whether the session crossed the proactive flush threshold
    pub needs_background_sync: bool,
    /// The id was already in the session; nothing changed
    pub duplicate: bool,
    /// Where the message went
    pub mode: AppendMode,
}

/// Result of [`SessionManager::expire_session`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpireOutcome {
    /// Messages flushed before deletion
    pub synced: usize,
    /// Whether a session existed and was removed
    pub deleted: bool,
}

/// Owns the session lifecycle on top of the cache and sync services.
pub struct SessionManager {
    cache: Arc<CacheService>,
    sync: Arc<SyncService>,
    clock: Arc<dyn Clock>,
    locks: ChatLocks,
    ttl: chrono::Duration,
    max_messages: usize,
    background_sync_trigger: usize,
    cold_start_page_size: usize,
    expiry_lookahead: chrono::Duration,
}

impl SessionManager {
    /// Create a session manager.
    #[must_use]
    pub fn new(
        cache: Arc<CacheService>,
        sync: Arc<SyncService>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        let max_messages = config.max_messages.max(1);
        Self {
            cache,
            sync,
            clock,
            locks: ChatLocks::default(),
            ttl: config.session_ttl_delta(),
            max_messages,
            background_sync_trigger: config.background_sync_trigger(),
            cold_start_page_size: config.cold_start_page_size.min(max_messages),
            expiry_lookahead: config.expiry_lookahead(),
        }
    }

    /// Append a message to a chat's session, creating the session if needed.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Sync`] if the oldest message had to be evicted and
    ///   could not be made durable first (the session is left untouched)
    /// - [`SessionError::Cache`] if the cache is unavailable and the
    ///   write-through fallback also failed
    pub async fn add_message(&self, chat_id: &str, new_message: NewMessage) -> SessionResult<AppendOutcome> {
        let now = self.clock.now();
        let message = new_message.into_message(now);
        let _guard = self.locks.lock(chat_id).await;

        match self.append_locked(chat_id, &message, now).await {
            Err(SessionError::Cache(e)) if e.is_unavailable() => self.write_through(chat_id, &message, e).await,
            other => other,
        }
    }

    async fn append_locked(
        &self,
        chat_id: &str,
        message: &MessageData,
        now: DateTime<Utc>,
    ) -> SessionResult<AppendOutcome> {
        let (mut session, origin) = match self.cache.get_session(chat_id).await? {
            Some(session) if session.is_active() => (session, None),
            _ => match self.cold_start(chat_id, now).await {
                Some(session) => (session, Some("cold_start")),
                None => (ChatSession::new(chat_id, &message.user_id, now, self.ttl), Some("fresh")),
            },
        };

        if session.contains_message(&message.id) {
            if origin.is_some() {
                self.cache.set_session(&session).await?;
            }
            tracing::debug!(chat_id, message_id = %message.id, "Duplicate message ignored");
            return Ok(self.outcome(&session, &message.id, Vec::new(), true));
        }

        let mut evicted = Vec::new();
        while session.messages.len() >= self.max_messages {
            if let Some(oldest) = session.messages.first().filter(|m| !m.synced_to_db) {
                self.sync.sync_single_message(chat_id, oldest).await?;
            }
            let removed = session.messages.remove(0);
            evicted.push(removed.id);
        }

        let sorts_last = session
            .messages
            .last()
            .is_none_or(|last| compare_messages(last, message) != Ordering::Greater);

        session.push_message(message.clone());
        session.touch(now, self.ttl);

        if origin.is_none() && evicted.is_empty() && sorts_last {
            self.cache.append_message(&session, message).await?;
        } else {
            self.cache.set_session(&session).await?;
        }

        if let Some(origin) = origin {
            SessionMetrics::record_created(origin);
            tracing::info!(chat_id, session_id = %session.session_id, origin, "Session created");
        }
        if !evicted.is_empty() {
            SessionMetrics::record_evictions(evicted.len());
            tracing::debug!(chat_id, evicted = evicted.len(), "Evicted oldest messages at cap");
        }
        SessionMetrics::record_append(AppendMode::Cached.as_str());

        self.cache.update_presence(chat_id, &message.user_id);
        self.cache
            .record_activity(&ActivityEvent::new(chat_id, &message.user_id, ActivityKind::Message, now));

        Ok(self.outcome(&session, &message.id, evicted, false))
    }

    async fn write_through(
        &self,
        chat_id: &str,
        message: &MessageData,
        cache_error: CacheError,
    ) -> SessionResult<AppendOutcome> {
        tracing::warn!(chat_id, message_id = %message.id, error = %cache_error, "Cache unavailable, writing message through");

        match self.sync.sync_single_message(chat_id, message).await {
            Ok(_) => {
                SessionMetrics::record_append(AppendMode::WriteThrough.as_str());
                Ok(AppendOutcome {
                    session_id: None,
                    message_id: message.id.clone(),
                    message_count: 0,
                    evicted: Vec::new(),
                    needs_background_sync: false,
                    duplicate: false,
                    mode: AppendMode::WriteThrough,
                })
            }
            Err(sync_error) => {
                tracing::error!(chat_id, message_id = %message.id, error = %sync_error, "Write-through failed");
                Err(SessionError::Cache(cache_error))
            }
        }
    }

    fn outcome(&self, session: &ChatSession, message_id: &str, evicted: Vec<String>, duplicate: bool) -> AppendOutcome {
        AppendOutcome {
            session_id: Some(session.session_id.clone()),
            message_id: message_id.to_string(),
            message_count: session.messages.len(),
            evicted,
            needs_background_sync: session.messages.len() >= self.background_sync_trigger,
            duplicate,
            mode: AppendMode::Cached,
        }
    }

    /// Cold start that never fails the append: durable read errors start fresh.
    async fn cold_start(&self, chat_id: &str, now: DateTime<Utc>) -> Option<ChatSession> {
        match self.build_from_durable(chat_id, now).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "Cold start failed, starting a fresh session");
                None
            }
        }
    }

    async fn build_from_durable(
        &self,
        chat_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ChatSession>, DurableStoreError> {
        let mut messages = self
            .sync
            .load_recent_messages(chat_id, self.cold_start_page_size)
            .await?;
        if messages.is_empty() {
            return Ok(None);
        }

        messages.reverse();
        for message in &mut messages {
            message.synced_to_db = true;
        }
        let participants = messages.iter().map(|m| m.user_id.clone()).collect();

        let mut session = ChatSession::with_participants(chat_id, participants, now, self.ttl);
        session.messages = messages;
        session.sort_messages();
        Ok(Some(session))
    }

    /// Load the active session of a chat.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the cache is unavailable.
    pub async fn get_session(&self, chat_id: &str) -> SessionResult<Option<ChatSession>> {
        Ok(self
            .cache
            .get_session(chat_id)
            .await?
            .filter(ChatSession::is_active))
    }

    /// Sorted messages of the active session (empty if none).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the cache is unavailable.
    pub async fn get_messages(&self, chat_id: &str) -> SessionResult<Vec<MessageData>> {
        Ok(self
            .get_session(chat_id)
            .await?
            .map(|session| session.messages)
            .unwrap_or_default())
    }

    /// Rebuild a session from the newest durable messages and store it.
    ///
    /// Returns `None` when the durable store has no messages for the chat.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Durable`] if the read fails, or
    /// [`SessionError::Cache`] if the session cannot be stored.
    pub async fn load_session_from_db(&self, chat_id: &str) -> SessionResult<Option<ChatSession>> {
        let _guard = self.locks.lock(chat_id).await;
        let Some(session) = self.build_from_durable(chat_id, self.clock.now()).await? else {
            return Ok(None);
        };
        self.cache.set_session(&session).await?;
        SessionMetrics::record_created("cold_start");
        tracing::info!(chat_id, messages = session.messages.len(), "Session loaded from durable storage");
        Ok(Some(session))
    }

    /// Slide a session's expiry without changing its content.
    ///
    /// Returns `false` if there is no session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the cache is unavailable.
    pub async fn refresh_session(&self, chat_id: &str) -> SessionResult<bool> {
        let _guard = self.locks.lock(chat_id).await;
        let now = self.clock.now();
        let expires_at = now + self.ttl.max(chrono::Duration::milliseconds(1));
        Ok(self.cache.refresh_expiry(chat_id, now, expires_at).await?)
    }

    /// Queue a presence heartbeat and a view event for `user_id`.
    pub fn record_view(&self, chat_id: &str, user_id: &str) {
        self.cache.update_presence(chat_id, user_id);
        self.cache
            .record_activity(&ActivityEvent::new(chat_id, user_id, ActivityKind::View, self.clock.now()));
    }

    /// Active sessions expiring within the lookahead window that still hold
    /// unsynced messages.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the session scan fails.
    pub async fn get_expiring_sessions(&self) -> SessionResult<Vec<ChatSession>> {
        let now = self.clock.now();
        Ok(self
            .cache
            .get_all_active_sessions()
            .await?
            .into_iter()
            .filter(|s| s.expires_within(now, self.expiry_lookahead) && s.has_unsynced())
            .collect())
    }

    /// Every active session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the session scan fails.
    pub async fn get_active_sessions(&self) -> SessionResult<Vec<ChatSession>> {
        Ok(self.cache.get_all_active_sessions().await?)
    }

    /// Whether a chat's session has reached the proactive flush threshold.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the cache is unavailable.
    pub async fn needs_background_sync(&self, chat_id: &str) -> SessionResult<bool> {
        Ok(self
            .get_session(chat_id)
            .await?
            .is_some_and(|s| self.is_over_threshold(&s)))
    }

    /// Whether `session` has reached the proactive flush threshold.
    #[must_use]
    pub fn is_over_threshold(&self, session: &ChatSession) -> bool {
        session.messages.len() >= self.background_sync_trigger
    }

    /// Flush the unsynced messages in the older half of a session.
    ///
    /// The chat lock is released while the batch is written; afterwards
    /// exactly the written messages are marked synced in the cache. Returns the
    /// number of messages made durable.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Sync`] if the batch fails (the durable prefix is
    /// still marked synced), or [`SessionError::Cache`] on cache failure.
    pub async fn perform_background_sync(&self, chat_id: &str) -> SessionResult<usize> {
        let snapshot = {
            let _guard = self.locks.lock(chat_id).await;
            self.get_session(chat_id).await?
        };
        let Some(session) = snapshot else {
            return Ok(0);
        };

        let half = session.messages.len() / 2;
        let pending: Vec<MessageData> = session.messages[..half]
            .iter()
            .filter(|m| !m.synced_to_db)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let (durable, failure) = match self.sync.batch_sync_messages(chat_id, &pending).await {
            Ok(report) => (report.synced, None),
            Err(e) => (e.synced(), Some(e)),
        };

        let ids: Vec<String> = pending[..durable].iter().map(|m| m.id.clone()).collect();
        self.mark_messages_synced(chat_id, &ids).await?;

        if let Some(e) = failure {
            return Err(e.into());
        }
        tracing::info!(chat_id, synced = durable, "Background sync completed");
        Ok(durable)
    }

    /// Flag a session as elected for an expiry flush.
    ///
    /// Returns `false` if there is no session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the cache is unavailable.
    pub async fn mark_syncing(&self, chat_id: &str) -> SessionResult<bool> {
        let _guard = self.locks.lock(chat_id).await;
        if self.get_session(chat_id).await?.is_none() {
            return Ok(false);
        }
        Ok(self.cache.set_status(chat_id, SessionStatus::Syncing).await?)
    }

    /// Mark the given messages durable in the cached session.
    ///
    /// Returns how many flags flipped; ids no longer in the session are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cache`] if the cache is unavailable.
    pub async fn mark_messages_synced(&self, chat_id: &str, ids: &[String]) -> SessionResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.locks.lock(chat_id).await;
        let Some(mut session) = self.cache.get_session(chat_id).await? else {
            return Ok(0);
        };
        let flipped = session.mark_synced(ids.iter().map(String::as_str));
        if flipped > 0 {
            self.cache.set_session(&session).await?;
        }
        Ok(flipped)
    }

    /// Flush every unsynced message, then delete the session from the cache.
    ///
    /// A session is never deleted while it holds unsynced content: if the
    /// flush fails it stays in place and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Sync`] if the flush fails, or
    /// [`SessionError::Cache`] on cache failure.
    pub async fn expire_session(&self, chat_id: &str) -> SessionResult<ExpireOutcome> {
        let _guard = self.locks.lock(chat_id).await;
        let Some(session) = self.cache.get_session(chat_id).await? else {
            return Ok(ExpireOutcome::default());
        };

        let synced = if session.has_unsynced() {
            match self.sync.sync_session_to_db(&session).await {
                Ok(report) => report.batch.synced,
                Err(e) => {
                    tracing::warn!(chat_id, error = %e, "Expiry flush failed, keeping session");
                    self.hold_for_retry(chat_id).await;
                    return Err(e.into());
                }
            }
        } else {
            0
        };

        // Everything is durable now. Flag the session first so that a failed
        // delete leaves it invisible to readers until its keys age out.
        self.cache.set_status(chat_id, SessionStatus::Expired).await?;
        let deleted = self.cache.delete_session(chat_id).await?;
        SessionMetrics::record_expired();
        tracing::info!(chat_id, session_id = %session.session_id, synced, "Session expired");
        Ok(ExpireOutcome { synced, deleted })
    }

    /// Keep a session whose expiry flush failed in the cache until the
    /// next attempt.
    ///
    /// Its keys get a fresh TTL while its logical expiry stays in the past,
    /// so later sweeps keep electing it. Best effort: failures are logged.
    pub async fn hold_for_retry(&self, chat_id: &str) {
        match self.cache.retain_keys(chat_id).await {
            Ok(()) => tracing::debug!(chat_id, "Extended key TTL of unflushed session"),
            Err(e) => tracing::warn!(chat_id, error = %e, "Could not extend key TTL of unflushed session"),
        }
    }

    /// Drop lock entries for chats nobody is using.
    pub fn prune_idle_locks(&self) -> usize {
        self.locks.prune()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("max_messages", &self.max_messages)
            .field("background_sync_trigger", &self.background_sync_trigger)
            .field("tracked_chats", &self.locks.len())
            .finish_non_exhaustive()
    }
}
