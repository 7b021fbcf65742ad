//! Durable message store contract.
//!
//! The durable store is the system of record. This subsystem only assumes:
//!
//! - an id-keyed, duplicate-safe message write (upsert or no-op on conflict)
//! - a chat metadata write
//! - a paginated message read (newest first, with limit/offset/before-id)
//! - a session history write
//!
//! # Implementations
//!
//! - `PostgresDurableStore` (in `chatsync-postgres`): production implementation
//! - `InMemoryDurableStore` (in `chatsync-testing`): deterministic tests with fault injection

use crate::cache_store::BoxFuture;
use crate::message::MessageData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during durable store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurableStoreError {
    /// Database connection or query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result of an idempotent message write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The id was new and the message was stored
    Inserted,
    /// The id already existed; nothing changed
    Duplicate,
}

/// Pagination for [`DurableStore::get_messages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Maximum number of messages returned
    pub limit: usize,
    /// Messages skipped from the newest end
    pub offset: usize,
    /// Only messages strictly older than this message id
    pub before_id: Option<String>,
}

impl MessageQuery {
    /// The newest `limit` messages.
    #[must_use]
    pub const fn latest(limit: usize) -> Self {
        Self {
            limit,
            offset: 0,
            before_id: None,
        }
    }

    /// Skip the newest `offset` messages.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Only messages older than `message_id`.
    #[must_use]
    pub fn before(mut self, message_id: impl Into<String>) -> Self {
        self.before_id = Some(message_id.into());
        self
    }
}

/// Chat-level bookkeeping written after a session sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMetadataUpdate {
    /// Chat being updated
    pub chat_id: String,
    /// Messages newly written by this sync (added to the running total)
    pub synced_message_count: u64,
    /// Session that performed the sync
    pub last_session_id: String,
    /// Participants known to that session
    pub participant_count: u32,
    /// When the sync finished
    pub last_synced_at: DateTime<Utc>,
}

/// Lightweight record of one cached session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    /// Session id (upsert key)
    pub session_id: String,
    /// Chat the session backed
    pub chat_id: String,
    /// Messages held by the session at sync time
    pub message_count: u32,
    /// Participants at sync time
    pub participant_count: u32,
    /// Session creation time
    pub started_at: DateTime<Utc>,
    /// Last activity in the session
    pub ended_at: DateTime<Utc>,
    /// When this entry was written
    pub synced_at: DateTime<Utc>,
}

/// Durable store abstraction.
///
/// # Idempotency
///
/// `add_message` MUST treat `message.id` as a de-duplication key: writing an
/// id that already exists returns [`WriteOutcome::Duplicate`] and leaves the
/// stored row untouched. The sync service relies on this to retry whole
/// batches safely.
pub trait DurableStore: Send + Sync {
    /// Persist one message keyed by its id.
    fn add_message(
        &self,
        chat_id: &str,
        message: &MessageData,
    ) -> BoxFuture<'_, Result<WriteOutcome, DurableStoreError>>;

    /// Upsert chat-level sync bookkeeping.
    fn update_chat_metadata(
        &self,
        update: ChatMetadataUpdate,
    ) -> BoxFuture<'_, Result<(), DurableStoreError>>;

    /// Read messages newest first.
    fn get_messages(
        &self,
        chat_id: &str,
        query: MessageQuery,
    ) -> BoxFuture<'_, Result<Vec<MessageData>, DurableStoreError>>;

    /// Upsert a session history record.
    fn record_session_history(
        &self,
        entry: SessionHistoryEntry,
    ) -> BoxFuture<'_, Result<(), DurableStoreError>>;
}
