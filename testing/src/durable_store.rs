//! In-memory [`DurableStore`] with fault injection.

use chatsync_core::{
    BoxFuture, ChatMetadataUpdate, DateTime, DurableStore, DurableStoreError, MessageData,
    MessageQuery, SessionHistoryEntry, Utc, WriteOutcome, compare_messages,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Accumulated chat bookkeeping, as the durable store would hold it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChatMetadata {
    /// Running total of messages written by syncs
    pub synced_message_count: u64,
    /// Last session that synced
    pub last_session_id: String,
    /// Participants reported by that session
    pub participant_count: u32,
    /// Time of the last sync
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    messages: HashMap<String, (String, MessageData)>,
    write_log: Vec<String>,
    metadata: HashMap<String, StoredChatMetadata>,
    history: HashMap<String, SessionHistoryEntry>,
    failing_ids: HashSet<String>,
}

/// In-memory durable store for tests.
///
/// Message ids are a global primary key: a second write of the same id is a
/// [`WriteOutcome::Duplicate`] no-op. Reads are newest first with the same
/// pagination semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    fail_adds: AtomicUsize,
    fail_metadata: AtomicBool,
    fail_history: AtomicBool,
    add_calls: AtomicUsize,
}

impl InMemoryDurableStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call while `false`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` `add_message` calls.
    pub fn fail_adds(&self, n: usize) {
        self.fail_adds.store(n, Ordering::SeqCst);
    }

    /// Always fail `add_message` for this id.
    pub fn fail_message(&self, message_id: impl Into<String>) {
        self.lock().failing_ids.insert(message_id.into());
    }

    /// Stop failing `add_message` for this id.
    pub fn heal_message(&self, message_id: &str) {
        self.lock().failing_ids.remove(message_id);
    }

    /// Fail `update_chat_metadata` while `true`.
    pub fn fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    /// Fail `record_session_history` while `true`.
    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Insert messages directly, as if written by an earlier process.
    pub fn seed_messages(&self, chat_id: &str, messages: impl IntoIterator<Item = MessageData>) {
        let mut state = self.lock();
        for message in messages {
            state
                .messages
                .insert(message.id.clone(), (chat_id.to_string(), message));
        }
    }

    /// Stored messages of a chat, oldest first.
    #[must_use]
    pub fn messages(&self, chat_id: &str) -> Vec<MessageData> {
        let mut messages = self.chat_messages(chat_id);
        messages.reverse();
        messages
    }

    /// Number of stored messages of a chat.
    #[must_use]
    pub fn message_count(&self, chat_id: &str) -> usize {
        self.lock()
            .messages
            .values()
            .filter(|(chat, _)| chat == chat_id)
            .count()
    }

    /// Whether a message id is stored.
    #[must_use]
    pub fn contains(&self, message_id: &str) -> bool {
        self.lock().messages.contains_key(message_id)
    }

    /// Ids of successful inserts, in write order (duplicates and seeds excluded).
    #[must_use]
    pub fn write_log(&self) -> Vec<String> {
        self.lock().write_log.clone()
    }

    /// `add_message` calls made (failed and duplicate ones included).
    #[must_use]
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    /// Accumulated metadata of a chat.
    #[must_use]
    pub fn metadata(&self, chat_id: &str) -> Option<StoredChatMetadata> {
        self.lock().metadata.get(chat_id).cloned()
    }

    /// Session history record.
    #[must_use]
    pub fn history(&self, session_id: &str) -> Option<SessionHistoryEntry> {
        self.lock().history.get(session_id).cloned()
    }

    /// Number of session history records.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: &str) -> Result<(), DurableStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DurableStoreError::Database(format!(
                "{operation}: connection refused"
            )));
        }
        Ok(())
    }

    // Newest first.
    fn chat_messages(&self, chat_id: &str) -> Vec<MessageData> {
        let mut messages: Vec<MessageData> = self
            .lock()
            .messages
            .values()
            .filter(|(chat, _)| chat == chat_id)
            .map(|(_, message)| MessageData {
                synced_to_db: true,
                ..message.clone()
            })
            .collect();
        messages.sort_by(|a, b| compare_messages(b, a));
        messages
    }
}

impl DurableStore for InMemoryDurableStore {
    fn add_message(
        &self,
        chat_id: &str,
        message: &MessageData,
    ) -> BoxFuture<'_, Result<WriteOutcome, DurableStoreError>> {
        let chat_id = chat_id.to_string();
        let message = message.clone();
        Box::pin(async move {
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            self.check("add_message")?;
            if self
                .fail_adds
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DurableStoreError::Database(
                    "add_message: injected failure".to_string(),
                ));
            }

            let mut state = self.lock();
            if state.failing_ids.contains(&message.id) {
                return Err(DurableStoreError::Database(format!(
                    "add_message: rejected {}",
                    message.id
                )));
            }
            if state.messages.contains_key(&message.id) {
                return Ok(WriteOutcome::Duplicate);
            }
            state.write_log.push(message.id.clone());
            state.messages.insert(message.id.clone(), (chat_id, message));
            Ok(WriteOutcome::Inserted)
        })
    }

    fn update_chat_metadata(
        &self,
        update: ChatMetadataUpdate,
    ) -> BoxFuture<'_, Result<(), DurableStoreError>> {
        Box::pin(async move {
            self.check("update_chat_metadata")?;
            if self.fail_metadata.load(Ordering::SeqCst) {
                return Err(DurableStoreError::Database(
                    "update_chat_metadata: injected failure".to_string(),
                ));
            }

            let mut state = self.lock();
            let previous = state
                .metadata
                .get(&update.chat_id)
                .map_or(0, |m| m.synced_message_count);
            state.metadata.insert(
                update.chat_id,
                StoredChatMetadata {
                    synced_message_count: previous + update.synced_message_count,
                    last_session_id: update.last_session_id,
                    participant_count: update.participant_count,
                    last_synced_at: update.last_synced_at,
                },
            );
            Ok(())
        })
    }

    fn get_messages(
        &self,
        chat_id: &str,
        query: MessageQuery,
    ) -> BoxFuture<'_, Result<Vec<MessageData>, DurableStoreError>> {
        let chat_id = chat_id.to_string();
        Box::pin(async move {
            self.check("get_messages")?;
            let messages = self.chat_messages(&chat_id);

            let older = match &query.before_id {
                Some(before_id) => match messages.iter().position(|m| &m.id == before_id) {
                    Some(anchor) => &messages[anchor + 1..],
                    None => return Ok(Vec::new()),
                },
                None => &messages[..],
            };

            Ok(older
                .iter()
                .skip(query.offset)
                .take(query.limit)
                .cloned()
                .collect())
        })
    }

    fn record_session_history(
        &self,
        entry: SessionHistoryEntry,
    ) -> BoxFuture<'_, Result<(), DurableStoreError>> {
        Box::pin(async move {
            self.check("record_session_history")?;
            if self.fail_history.load(Ordering::SeqCst) {
                return Err(DurableStoreError::Database(
                    "record_session_history: injected failure".to_string(),
                ));
            }
            self.lock().history.insert(entry.session_id.clone(), entry);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::helpers::messages_from;
    use crate::mocks::test_time;

    #[tokio::test]
    async fn second_write_of_an_id_is_a_duplicate() {
        let store = InMemoryDurableStore::new();
        let message = &messages_from(test_time(), 1)[0];

        assert_eq!(store.add_message("c", message).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(store.add_message("c", message).await.unwrap(), WriteOutcome::Duplicate);
        assert_eq!(store.write_log().len(), 1);
        assert_eq!(store.add_calls(), 2);
    }

    #[tokio::test]
    async fn pages_newest_first() {
        let store = InMemoryDurableStore::new();
        store.seed_messages("c", messages_from(test_time(), 10));

        let page = store.get_messages("c", MessageQuery::latest(3)).await.unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m9", "m8", "m7"]);
        assert!(page.iter().all(|m| m.synced_to_db));

        let page = store
            .get_messages("c", MessageQuery::latest(2).with_offset(1).before("m5"))
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m3", "m2"]);
    }

    #[tokio::test]
    async fn unknown_anchor_returns_nothing() {
        let store = InMemoryDurableStore::new();
        store.seed_messages("c", messages_from(test_time(), 3));

        let page = store
            .get_messages("c", MessageQuery::latest(10).before("nope"))
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryDurableStore::new();
        let messages = messages_from(test_time(), 2);
        store.fail_adds(1);

        assert!(store.add_message("c", &messages[0]).await.is_err());
        assert!(store.add_message("c", &messages[0]).await.is_ok());

        store.fail_message("m1");
        assert!(store.add_message("c", &messages[1]).await.is_err());
        store.heal_message("m1");
        assert!(store.add_message("c", &messages[1]).await.is_ok());
    }
}
