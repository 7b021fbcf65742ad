//! Non-critical activity telemetry recorded alongside sessions.
//!
//! Activity events are eventually applied: the cache service queues them and
//! flushes in batches, so losing the tail of this stream during an outage
//! never affects message durability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    /// A message was appended
    Message,
    /// The chat was read or viewed
    View,
    /// A participant signalled presence
    Presence,
}

impl ActivityKind {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::View => "view",
            Self::Presence => "presence",
        }
    }

    /// Parse from the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "view" => Some(Self::View),
            "presence" => Some(Self::Presence),
            _ => None,
        }
    }
}

/// One activity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Chat the activity belongs to
    pub chat_id: String,
    /// Acting user
    pub user_id: String,
    /// What happened
    pub kind: ActivityKind,
    /// When it happened
    pub at: DateTime<Utc>,
}

impl ActivityEvent {
    /// Create an activity record.
    #[must_use]
    pub fn new(
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: ActivityKind,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            kind,
            at,
        }
    }
}
