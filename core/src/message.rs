//! Chat messages as tracked by the session cache.
//!
//! # Ordering
//!
//! Every materialized message list is sorted by [`compare_messages`]:
//!
//! 1. `timestamp` ascending
//! 2. non-assistant (user/system) before assistant on equal timestamps
//! 3. `id` lexicographic
//!
//! so a user message and the AI reply that shares its timestamp always
//! interleave the same way, regardless of write arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Author role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Written by a human participant
    User,
    /// Generated reply
    Assistant,
    /// Injected by the application
    System,
}

impl MessageType {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parse from the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Whether this message sorts after its same-timestamp peers.
    #[must_use]
    pub const fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant)
    }
}

/// One chat message held in a cached session.
///
/// `id` is the idempotency key for durable persistence: writing the same id
/// twice must be a no-op downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    /// Caller-supplied or generated identifier
    pub id: String,
    /// Message body
    pub content: String,
    /// Author
    pub user_id: String,
    /// Creation time, encoded as epoch milliseconds
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Author role
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque payload, never interpreted here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Set only after a confirmed durable write
    #[serde(default)]
    pub synced_to_db: bool,
}

/// Total order used for every materialized message list.
#[must_use]
pub fn compare_messages(a: &MessageData, b: &MessageData) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| {
            a.message_type
                .is_assistant()
                .cmp(&b.message_type.is_assistant())
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort messages in place by [`compare_messages`].
pub fn sort_messages(messages: &mut [MessageData]) {
    messages.sort_by(compare_messages);
}

/// A message submitted for append, before the cache assigns defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    /// Caller-supplied id; generated when absent
    pub id: Option<String>,
    /// Message body
    pub content: String,
    /// Author
    pub user_id: String,
    /// Author role
    pub message_type: MessageType,
    /// Caller-supplied timestamp; the append time when absent
    pub timestamp: Option<DateTime<Utc>>,
    /// Opaque payload
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    /// Create a message with a generated id and the append time as timestamp.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: None,
            content: content.into(),
            user_id: user_id.into(),
            message_type,
            timestamp: None,
            metadata: None,
        }
    }

    /// Use a caller-supplied id (idempotency key).
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Use a caller-supplied timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach an opaque payload.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Resolve defaults and produce an unsynced [`MessageData`].
    #[must_use]
    pub fn into_message(self, now: DateTime<Utc>) -> MessageData {
        MessageData {
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            content: self.content,
            user_id: self.user_id,
            timestamp: self.timestamp.unwrap_or(now),
            message_type: self.message_type,
            metadata: self.metadata,
            synced_to_db: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(millis: i64, id: &str, message_type: MessageType) -> MessageData {
        NewMessage::new("u1", "text", message_type)
            .with_id(id)
            .with_timestamp(Utc.timestamp_millis_opt(millis).unwrap())
            .into_message(Utc::now())
    }

    #[test]
    fn user_message_sorts_before_assistant_reply_with_same_timestamp() {
        let mut messages = vec![
            at(1_000, "a-reply", MessageType::Assistant),
            at(1_000, "z-question", MessageType::User),
        ];
        sort_messages(&mut messages);

        assert_eq!(messages[0].id, "z-question");
        assert_eq!(messages[1].id, "a-reply");
    }

    #[test]
    fn system_messages_count_as_non_assistant() {
        let mut messages = vec![
            at(5, "b", MessageType::Assistant),
            at(5, "c", MessageType::System),
            at(5, "a", MessageType::User),
        ];
        sort_messages(&mut messages);

        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[test]
    fn message_json_uses_epoch_millis_and_type_tag() {
        let message = at(1_700_000_000_123, "m1", MessageType::System);
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["timestamp"], 1_700_000_000_123_i64);
        assert_eq!(json["type"], "system");
        assert_eq!(json["syncedToDb"], false);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn generated_ids_are_unique() {
        let now = Utc::now();
        let a = NewMessage::new("u", "x", MessageType::User).into_message(now);
        let b = NewMessage::new("u", "x", MessageType::User).into_message(now);
        assert_ne!(a.id, b.id);
        assert_eq!(a.timestamp, now);
    }

    #[test]
    fn message_type_round_trips_through_storage_names() {
        for t in [MessageType::User, MessageType::Assistant, MessageType::System] {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("bot"), None);
    }

    fn arb_message() -> impl Strategy<Value = MessageData> {
        (0_i64..50, "[a-f]{1,3}", 0_u8..3).prop_map(|(ts, id, kind)| {
            let message_type = match kind {
                0 => MessageType::User,
                1 => MessageType::Assistant,
                _ => MessageType::System,
            };
            at(ts, &id, message_type)
        })
    }

    proptest! {
        #[test]
        fn sorted_lists_respect_every_tie_break(mut messages in prop::collection::vec(arb_message(), 0..40)) {
            sort_messages(&mut messages);

            for pair in messages.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.timestamp <= b.timestamp);
                if a.timestamp == b.timestamp {
                    prop_assert!(!a.message_type.is_assistant() || b.message_type.is_assistant());
                    if a.message_type.is_assistant() == b.message_type.is_assistant() {
                        prop_assert!(a.id <= b.id);
                    }
                }
            }
        }

        #[test]
        fn sort_is_independent_of_arrival_order(messages in prop::collection::vec(arb_message(), 0..30)) {
            let mut forward = messages.clone();
            let mut backward: Vec<_> = messages.into_iter().rev().collect();
            sort_messages(&mut forward);
            sort_messages(&mut backward);

            let forward_keys: Vec<_> = forward.iter().map(|m| (m.timestamp, m.message_type, m.id.clone())).collect();
            let backward_keys: Vec<_> = backward.iter().map(|m| (m.timestamp, m.message_type, m.id.clone())).collect();
            prop_assert_eq!(forward_keys, backward_keys);
        }
    }
}
