//! Key layout and value encoding for cached sessions.
//!
//! ```text
//! chat_session:{chat_id}   hash    session metadata fields
//! chat_messages:{chat_id}  list    one JSON message per element, sorted
//! chat_presence:{chat_id}  hash    user_id -> last seen (epoch millis)
//! chat_activity:{chat_id}  stream  activity events, capped
//! ```

use chatsync_core::{
    ActivityEvent, ActivityKind, CacheError, ChatSession, DateTime, MessageData, SessionStatus,
    StreamEntry, Utc,
};
use std::collections::{BTreeSet, HashMap};

const SESSION_PREFIX: &str = "chat_session:";

/// Glob matching every session metadata key.
pub const SESSION_KEY_PATTERN: &str = "chat_session:*";

/// Session metadata hash key.
#[must_use]
pub fn session_key(chat_id: &str) -> String {
    format!("{SESSION_PREFIX}{chat_id}")
}

/// Message list key.
#[must_use]
pub fn messages_key(chat_id: &str) -> String {
    format!("chat_messages:{chat_id}")
}

/// Presence hash key.
#[must_use]
pub fn presence_key(chat_id: &str) -> String {
    format!("chat_presence:{chat_id}")
}

/// Activity stream key.
#[must_use]
pub fn activity_key(chat_id: &str) -> String {
    format!("chat_activity:{chat_id}")
}

/// Extract the chat id from a session metadata key.
#[must_use]
pub fn chat_id_from_session_key(key: &str) -> Option<&str> {
    key.strip_prefix(SESSION_PREFIX).filter(|id| !id.is_empty())
}

/// Encode the expiry fields touched by a TTL refresh.
#[must_use]
pub fn expiry_fields(last_activity_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Vec<(String, String)> {
    vec![
        ("last_activity_at".to_string(), last_activity_at.timestamp_millis().to_string()),
        ("expires_at".to_string(), expires_at.timestamp_millis().to_string()),
    ]
}

/// Encode every metadata field of a session.
///
/// # Errors
///
/// Returns [`CacheError::Serialization`] if the participant set cannot be encoded.
pub fn encode_metadata(session: &ChatSession) -> Result<Vec<(String, String)>, CacheError> {
    let participants = serde_json::to_string(&session.participants)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;

    let mut fields = vec![
        ("session_id".to_string(), session.session_id.clone()),
        ("chat_id".to_string(), session.chat_id.clone()),
        ("participants".to_string(), participants),
        ("created_at".to_string(), session.created_at.timestamp_millis().to_string()),
        ("status".to_string(), session.status.as_str().to_string()),
        ("message_count".to_string(), session.messages.len().to_string()),
    ];
    fields.extend(expiry_fields(session.last_activity_at, session.expires_at));
    Ok(fields)
}

/// Encode one message list element.
///
/// # Errors
///
/// Returns [`CacheError::Serialization`] if the message cannot be encoded.
pub fn encode_message(message: &MessageData) -> Result<String, CacheError> {
    serde_json::to_string(message).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Encode a whole message list.
///
/// # Errors
///
/// Returns [`CacheError::Serialization`] if any message cannot be encoded.
pub fn encode_messages(messages: &[MessageData]) -> Result<Vec<String>, CacheError> {
    messages.iter().map(encode_message).collect()
}

/// Decode one message list element.
///
/// # Errors
///
/// Returns [`CacheError::DataCorruption`] naming `key` if the element is malformed.
pub fn decode_message(key: &str, raw: &str) -> Result<MessageData, CacheError> {
    serde_json::from_str(raw).map_err(|e| corrupt(key, e.to_string()))
}

/// Decode a metadata hash into a session without messages.
///
/// # Errors
///
/// Returns [`CacheError::DataCorruption`] if a field is missing or malformed.
pub fn decode_metadata(key: &str, fields: &HashMap<String, String>) -> Result<ChatSession, CacheError> {
    let field = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| corrupt(key, format!("missing field {name}")))
    };
    let millis = |name: &str| -> Result<DateTime<Utc>, CacheError> {
        let raw = field(name)?;
        raw.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| corrupt(key, format!("invalid timestamp in {name}: {raw}")))
    };

    let participants: BTreeSet<String> = serde_json::from_str(field("participants")?)
        .map_err(|e| corrupt(key, format!("invalid participants: {e}")))?;
    let status_raw = field("status")?;
    let status = SessionStatus::parse(status_raw)
        .ok_or_else(|| corrupt(key, format!("unknown status {status_raw}")))?;

    Ok(ChatSession {
        session_id: field("session_id")?.to_string(),
        chat_id: field("chat_id")?.to_string(),
        participants,
        messages: Vec::new(),
        created_at: millis("created_at")?,
        last_activity_at: millis("last_activity_at")?,
        expires_at: millis("expires_at")?,
        status,
    })
}

/// Encode an activity event as stream fields.
#[must_use]
pub fn activity_fields(event: &ActivityEvent) -> Vec<(String, String)> {
    vec![
        ("user_id".to_string(), event.user_id.clone()),
        ("kind".to_string(), event.kind.as_str().to_string()),
        ("at".to_string(), event.at.timestamp_millis().to_string()),
    ]
}

/// Decode a stream entry back into an activity event.
///
/// Returns `None` for entries missing a field.
#[must_use]
pub fn decode_activity(chat_id: &str, entry: &StreamEntry) -> Option<ActivityEvent> {
    let user_id = entry.field("user_id")?;
    let kind = ActivityKind::parse(entry.field("kind")?)?;
    let at = entry
        .field("at")?
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)?;
    Some(ActivityEvent::new(chat_id, user_id, kind, at))
}

fn corrupt(key: &str, reason: String) -> CacheError {
    CacheError::DataCorruption {
        key: key.to_string(),
        reason,
    }
}
