//! Error types for the sync and session services.

use chatsync_core::{CacheError, DurableStoreError};
use thiserror::Error;

/// Durable synchronization failed after retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A write (single message or chunk) exhausted its retries.
    ///
    /// Chunks before the failing one stay written; `synced` counts them.
    #[error("Sync failed for chat {chat_id} after {attempts} attempts ({synced} messages already synced): {reason}")]
    Failed {
        /// Chat being synced
        chat_id: String,
        /// Messages durably written before the failure
        synced: usize,
        /// Attempts made on the failing write
        attempts: usize,
        /// Last durable store error
        reason: String,
    },
}

impl SyncError {
    /// Messages durably written before the failure.
    #[must_use]
    pub const fn synced(&self) -> usize {
        match self {
            Self::Failed { synced, .. } => *synced,
        }
    }
}

/// Errors surfaced by the session manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Cache failure that no fallback could absorb
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Durable write failure (eviction sync, expiry flush, write-through)
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Durable read failure
    #[error(transparent)]
    Durable(#[from] DurableStoreError),
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
