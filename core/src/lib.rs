//! # Chatsync Core
//!
//! Domain types and collaborator contracts for the chat session cache.
//!
//! This crate holds everything that has no I/O of its own:
//!
//! - **`ChatSession` / `MessageData`**: the cached unit and its messages
//! - **Ordering**: the deterministic sort every materialized message list follows
//! - **`CacheStore`**: the remote key-value/hash/list/stream store contract
//! - **`DurableStore`**: the idempotent durable message store contract
//! - **`SyncConfig`**: every tuning knob of the subsystem
//! - **`Clock`**: injected time source
//!
//! The services that drive these types live in `chatsync-runtime`; concrete
//! stores live in `chatsync-redis` and `chatsync-postgres`.
//!
//! ## Example
//!
//! ```
//! use chatsync_core::message::{MessageType, NewMessage};
//! use chatsync_core::session::ChatSession;
//! use chrono::{Duration, Utc};
//!
//! let now = Utc::now();
//! let mut session = ChatSession::new("chat-1", "alice", now, Duration::hours(1));
//! let message = NewMessage::new("alice", "hello", MessageType::User).into_message(now);
//! session.push_message(message);
//!
//! assert_eq!(session.messages.len(), 1);
//! assert!(session.has_unsynced());
//! ```

pub mod activity;
pub mod cache_store;
pub mod config;
pub mod durable_store;
pub mod environment;
pub mod message;
pub mod session;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub use activity::{ActivityEvent, ActivityKind};
pub use cache_store::{BoxFuture, CacheCommand, CacheError, CacheResult, CacheStore, StreamEntry};
pub use config::{ConfigError, SyncConfig};
pub use durable_store::{
    ChatMetadataUpdate, DurableStore, DurableStoreError, MessageQuery, SessionHistoryEntry,
    WriteOutcome,
};
pub use environment::{Clock, SystemClock};
pub use message::{MessageData, MessageType, NewMessage, compare_messages, sort_messages};
pub use session::{ChatSession, SessionStatus};
