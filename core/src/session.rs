//! The cached chat session.
//!
//! A `ChatSession` backs one conversation (`chat_id`) while it is hot. It is
//! written to the cache as a whole value on every mutation and carries a
//! sliding expiry: every activity-producing operation moves `expires_at` to
//! `now + TTL`.
//!
//! # Lifecycle
//!
//! ```text
//! (created on first append) ─► Active ─► Syncing ─► Expired ─► (deleted from cache)
//! ```
//!
//! `Syncing` is advisory: appends are still accepted while a flush runs.
//! `Expired` is set once every message is durable, right before deletion.

use crate::message::{MessageData, sort_messages};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting appends
    Active,
    /// Elected by the background worker for an expiry flush
    Syncing,
    /// Fully flushed and awaiting deletion; treated as absent
    Expired,
}

impl SessionStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Syncing => "syncing",
            Self::Expired => "expired",
        }
    }

    /// Parse from the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "syncing" => Some(Self::Syncing),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// The unit of caching: one conversation's recent message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    /// Unique per session, never reused
    pub session_id: String,
    /// Conversation this session backs
    pub chat_id: String,
    /// Everyone who has contributed; only grows
    pub participants: BTreeSet<String>,
    /// Sorted by [`crate::message::compare_messages`]
    pub messages: Vec<MessageData>,
    /// Creation time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last activity-producing operation
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity_at: DateTime<Utc>,
    /// Always later than `last_activity_at`
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: SessionStatus,
}

impl ChatSession {
    /// Create an empty active session with `creator` as sole participant.
    #[must_use]
    pub fn new(
        chat_id: impl Into<String>,
        creator: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let mut participants = BTreeSet::new();
        participants.insert(creator.into());
        Self::with_participants(chat_id, participants, now, ttl)
    }

    /// Create an empty active session with a known participant set.
    #[must_use]
    pub fn with_participants(
        chat_id: impl Into<String>,
        participants: BTreeSet<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            participants,
            messages: Vec::new(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + positive(ttl),
            status: SessionStatus::Active,
        }
    }

    /// Slide the expiry window: `last_activity_at = now`, `expires_at = now + ttl`.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.last_activity_at = now;
        self.expires_at = now + positive(ttl);
    }

    /// Append a message, register its author and restore sort order.
    pub fn push_message(&mut self, message: MessageData) {
        self.participants.insert(message.user_id.clone());
        self.messages.push(message);
        self.sort_messages();
    }

    /// Restore the deterministic message order.
    pub fn sort_messages(&mut self) {
        sort_messages(&mut self.messages);
    }

    /// Whether a message with this id is already held.
    #[must_use]
    pub fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    /// Messages not yet confirmed durable, in order.
    pub fn unsynced_messages(&self) -> impl Iterator<Item = &MessageData> {
        self.messages.iter().filter(|m| !m.synced_to_db)
    }

    /// Number of messages not yet confirmed durable.
    #[must_use]
    pub fn unsynced_count(&self) -> usize {
        self.unsynced_messages().count()
    }

    /// Whether any message still needs a durable write.
    #[must_use]
    pub fn has_unsynced(&self) -> bool {
        self.messages.iter().any(|m| !m.synced_to_db)
    }

    /// Mark the given message ids as durable. Returns how many flags flipped.
    pub fn mark_synced<'a, I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let ids: HashSet<&str> = ids.into_iter().collect();
        let mut flipped = 0;
        for message in &mut self.messages {
            if !message.synced_to_db && ids.contains(message.id.as_str()) {
                message.synced_to_db = true;
                flipped += 1;
            }
        }
        flipped
    }

    /// Whether the session expires at or before `now + window`.
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at <= now + window
    }

    /// Anything but `Expired`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status != SessionStatus::Expired
    }
}

// A zero TTL would violate `expires_at > last_activity_at`.
fn positive(ttl: Duration) -> Duration {
    ttl.max(Duration::milliseconds(1))
}
