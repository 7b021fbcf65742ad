//! Integration tests for the session manager's append path and lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use chatsync_core::{
    ActivityKind, CacheError, Clock, MessageType, NewMessage, SessionStatus, compare_messages,
};
use chatsync_runtime::{AppendMode, SessionError};
use chatsync_testing::helpers::{messages_from, new_message};
use chatsync_testing::properties::new_messages;
use chatsync_testing::test_time;
use common::{Harness, fast_config};
use proptest::prelude::*;
use std::cmp::Ordering;
use std::collections::HashSet;

fn at(secs: i64) -> chatsync_core::DateTime<chatsync_core::Utc> {
    test_time() + chrono::Duration::seconds(secs)
}

// ============================================================================
// Session creation
// ============================================================================

#[tokio::test]
async fn first_message_creates_a_fresh_session() {
    let h = Harness::new(fast_config());

    let outcome = h
        .manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();

    assert_eq!(outcome.mode, AppendMode::Cached);
    assert_eq!(outcome.message_count, 1);
    assert!(!outcome.duplicate);
    assert!(outcome.session_id.is_some());

    let session = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(session.participants.len(), 1);
    assert!(session.participants.contains("alice"));
    assert_eq!(session.expires_at, h.clock.now() + chrono::Duration::hours(1));
    assert_eq!(h.durable.add_calls(), 0);
}

#[tokio::test]
async fn cold_start_loads_recent_history() {
    let h = Harness::new(fast_config());
    h.durable
        .seed_messages("chat-1", messages_from(at(-7200), 30));

    let outcome = h
        .manager
        .add_message("chat-1", new_message("fresh", "carol", at(0)))
        .await
        .unwrap();
    assert_eq!(outcome.message_count, 31);

    let session = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 31);
    assert_eq!(session.unsynced_count(), 1);
    assert_eq!(session.messages.first().unwrap().id, "m0");
    assert_eq!(session.messages.last().unwrap().id, "fresh");
    for user in ["alice", "bob", "carol"] {
        assert!(session.participants.contains(user), "missing participant {user}");
    }
}

#[tokio::test]
async fn cold_start_is_capped_at_page_size() {
    let h = Harness::new(fast_config());
    h.durable
        .seed_messages("chat-1", messages_from(at(-7200), 60));

    let outcome = h
        .manager
        .add_message("chat-1", new_message("fresh", "alice", at(0)))
        .await
        .unwrap();

    assert_eq!(outcome.message_count, 51);
    let messages = h.manager.get_messages("chat-1").await.unwrap();
    assert_eq!(messages[0].id, "m10");
}

#[tokio::test]
async fn cold_start_read_failure_starts_fresh() {
    let h = Harness::new(fast_config());
    h.durable
        .seed_messages("chat-1", messages_from(at(-7200), 5));
    h.durable.set_available(false);

    let outcome = h
        .manager
        .add_message("chat-1", new_message("fresh", "alice", at(0)))
        .await
        .unwrap();

    assert_eq!(outcome.mode, AppendMode::Cached);
    assert_eq!(outcome.message_count, 1);
}

#[tokio::test]
async fn load_session_from_db_marks_history_synced() {
    let h = Harness::new(fast_config());
    h.durable
        .seed_messages("chat-1", messages_from(at(-600), 10));

    let session = h.manager.load_session_from_db("chat-1").await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 10);
    assert!(!session.has_unsynced());

    let cached = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(cached.session_id, session.session_id);

    assert!(h.manager.load_session_from_db("empty").await.unwrap().is_none());
}

// ============================================================================
// Append semantics
// ============================================================================

#[tokio::test]
async fn duplicate_ids_are_ignored() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();

    let outcome = h
        .manager
        .add_message("chat-1", new_message("m0", "alice", at(5)))
        .await
        .unwrap();

    assert!(outcome.duplicate);
    assert_eq!(outcome.message_count, 1);
    assert_eq!(h.manager.get_messages("chat-1").await.unwrap()[0].timestamp, at(0));
}

#[tokio::test]
async fn user_message_precedes_reply_with_same_timestamp() {
    let h = Harness::new(fast_config());
    let reply = NewMessage::new("bot", "answer", MessageType::Assistant)
        .with_id("a-reply")
        .with_timestamp(at(0));
    let question = NewMessage::new("alice", "question", MessageType::User)
        .with_id("z-question")
        .with_timestamp(at(0));

    h.manager.add_message("chat-1", reply).await.unwrap();
    h.manager.add_message("chat-1", question).await.unwrap();

    let ids: Vec<_> = h
        .manager
        .get_messages("chat-1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, ["z-question", "a-reply"]);
}

#[tokio::test]
async fn late_message_is_inserted_in_order() {
    let h = Harness::new(fast_config());
    for (id, secs) in [("m0", 0), ("m2", 2), ("m1", 1)] {
        h.manager
            .add_message("chat-1", new_message(id, "alice", at(secs)))
            .await
            .unwrap();
    }

    let ids: Vec<_> = h
        .manager
        .get_messages("chat-1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, ["m0", "m1", "m2"]);
}

#[tokio::test]
async fn append_queues_presence_and_activity() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();

    assert_eq!(h.cache.pending_writes(), 4);
    assert_eq!(h.cache.flush_pending().await.unwrap(), 4);

    let presence = h.cache_store.hash("chat_presence:chat-1").unwrap();
    assert!(presence.contains_key("alice"));

    let activity = h.cache.recent_activity("chat-1", 10).await.unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].kind, ActivityKind::Message);
}

#[tokio::test]
async fn record_view_appends_view_activity() {
    let h = Harness::new(fast_config());
    h.manager.record_view("chat-1", "bob");
    h.cache.flush_pending().await.unwrap();

    let activity = h.cache.recent_activity("chat-1", 10).await.unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].kind, ActivityKind::View);
    assert_eq!(activity[0].user_id, "bob");
}

// ============================================================================
// Cap eviction
// ============================================================================

#[tokio::test]
async fn eviction_syncs_oldest_message_first() {
    let h = Harness::new(fast_config().with_max_messages(5));
    for i in 0..5 {
        h.manager
            .add_message("chat-1", new_message(&format!("m{i}"), "alice", at(i)))
            .await
            .unwrap();
    }

    let outcome = h
        .manager
        .add_message("chat-1", new_message("m5", "alice", at(5)))
        .await
        .unwrap();

    assert_eq!(outcome.evicted, ["m0"]);
    assert_eq!(outcome.message_count, 5);
    assert!(outcome.needs_background_sync);
    assert!(h.durable.contains("m0"));
    assert_eq!(h.durable.write_log(), ["m0"]);

    let ids: Vec<_> = h
        .manager
        .get_messages("chat-1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, ["m1", "m2", "m3", "m4", "m5"]);
}

#[tokio::test]
async fn evicting_a_synced_message_skips_the_durable_write() {
    let h = Harness::new(fast_config().with_max_messages(5));
    h.durable
        .seed_messages("chat-1", messages_from(at(-60), 5));

    let outcome = h
        .manager
        .add_message("chat-1", new_message("fresh", "alice", at(0)))
        .await
        .unwrap();

    assert_eq!(outcome.evicted, ["m0"]);
    assert_eq!(h.durable.add_calls(), 0);
}

#[tokio::test]
async fn failed_eviction_sync_leaves_session_untouched() {
    let h = Harness::new(fast_config().with_max_messages(3));
    for i in 0..3 {
        h.manager
            .add_message("chat-1", new_message(&format!("m{i}"), "alice", at(i)))
            .await
            .unwrap();
    }
    h.durable.fail_message("m0");

    let result = h
        .manager
        .add_message("chat-1", new_message("m3", "alice", at(3)))
        .await;

    assert!(matches!(result, Err(SessionError::Sync(_))));
    let ids: Vec<_> = h
        .manager
        .get_messages("chat-1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, ["m0", "m1", "m2"]);
}

// ============================================================================
// Degraded mode
// ============================================================================

#[tokio::test]
async fn cache_outage_writes_through() {
    let h = Harness::new(fast_config());
    h.cache_store.set_available(false);

    let outcome = h
        .manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();

    assert_eq!(outcome.mode, AppendMode::WriteThrough);
    assert!(outcome.session_id.is_none());
    assert!(h.durable.contains("m0"));
    assert!(!h.cache.health().connected);
}

#[tokio::test]
async fn double_outage_surfaces_cache_unavailable() {
    let h = Harness::new(fast_config());
    h.cache_store.set_available(false);
    h.durable.set_available(false);

    let result = h
        .manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await;

    assert!(matches!(
        result,
        Err(SessionError::Cache(CacheError::Unavailable { .. }))
    ));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_to_one_chat_are_all_kept() {
    let h = Harness::new(fast_config());

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let manager = h.manager.clone();
            tokio::spawn(async move {
                manager
                    .add_message("chat-1", new_message(&format!("m{i:02}"), "alice", at(i)))
                    .await
            })
        })
        .collect();

    let mut session_ids = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.mode, AppendMode::Cached);
        session_ids.insert(outcome.session_id.unwrap());
    }

    let messages = h.manager.get_messages("chat-1").await.unwrap();
    assert_eq!(messages.len(), 50);
    let ids: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
    let expected: Vec<_> = (0..50).map(|i| format!("m{i:02}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(session_ids.len(), 1);
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test]
async fn refresh_slides_expiry() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();

    h.advance_secs(600);
    assert!(h.manager.refresh_session("chat-1").await.unwrap());

    let session = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(session.last_activity_at, h.clock.now());
    assert_eq!(session.expires_at, h.clock.now() + chrono::Duration::hours(1));
    assert_eq!(session.messages.len(), 1);

    assert!(!h.manager.refresh_session("missing").await.unwrap());
}

#[tokio::test]
async fn expire_flushes_then_deletes() {
    let h = Harness::new(fast_config());
    for i in 0..3 {
        h.manager
            .add_message("chat-1", new_message(&format!("m{i}"), "alice", at(i)))
            .await
            .unwrap();
    }
    let session_id = h.manager.get_session("chat-1").await.unwrap().unwrap().session_id;

    let outcome = h.manager.expire_session("chat-1").await.unwrap();

    assert_eq!(outcome.synced, 3);
    assert!(outcome.deleted);
    assert_eq!(h.durable.message_count("chat-1"), 3);
    assert!(h.manager.get_session("chat-1").await.unwrap().is_none());
    assert!(!h.cache_store.contains_key("chat_messages:chat-1"));
    assert_eq!(h.durable.metadata("chat-1").unwrap().synced_message_count, 3);
    assert_eq!(h.durable.history(&session_id).unwrap().message_count, 3);
}

#[tokio::test]
async fn failed_flush_keeps_the_session() {
    let h = Harness::new(fast_config());
    for i in 0..3 {
        h.manager
            .add_message("chat-1", new_message(&format!("m{i}"), "alice", at(i)))
            .await
            .unwrap();
    }
    h.durable.set_available(false);

    let result = h.manager.expire_session("chat-1").await;

    assert!(matches!(result, Err(SessionError::Sync(_))));
    let session = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(session.unsynced_count(), 3);
}

#[tokio::test]
async fn expired_status_hides_a_leftover_session() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();
    let old_id = h.manager.get_session("chat-1").await.unwrap().unwrap().session_id;

    // A flushed session whose delete did not go through.
    assert!(h.cache.set_status("chat-1", SessionStatus::Expired).await.unwrap());
    h.advance_secs(3590);

    assert!(h.manager.get_session("chat-1").await.unwrap().is_none());
    assert!(h.manager.get_expiring_sessions().await.unwrap().is_empty());

    let outcome = h
        .manager
        .add_message("chat-1", new_message("m1", "bob", h.clock.now()))
        .await
        .unwrap();
    assert_ne!(outcome.session_id.as_deref(), Some(old_id.as_str()));
}

#[tokio::test]
async fn status_and_expiry_updates_never_recreate_a_missing_session() {
    let h = Harness::new(fast_config());

    assert!(!h.cache.set_status("gone", SessionStatus::Syncing).await.unwrap());
    assert!(!h.cache.refresh_expiry("gone", h.clock.now(), h.clock.now()).await.unwrap());
    assert!(!h.cache_store.contains_key("chat_session:gone"));
    assert!(!h.manager.mark_syncing("gone").await.unwrap());
}

#[tokio::test]
async fn expiring_a_missing_session_is_a_no_op() {
    let h = Harness::new(fast_config());
    let outcome = h.manager.expire_session("nobody").await.unwrap();
    assert!(!outcome.deleted);
    assert_eq!(outcome.synced, 0);
}

#[tokio::test]
async fn cache_keys_outlive_the_session_window() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();

    let ttl = h.cache_store.ttl_of("chat_session:chat-1").unwrap();
    assert_eq!(ttl, h.config.key_ttl());

    h.advance_secs(3600 + 301);
    assert!(h.manager.get_session("chat-1").await.unwrap().is_none());
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn cached_messages_stay_sorted(messages in new_messages(20)) {
        let (count, stored) = tokio_test::block_on(async {
            let h = Harness::new(fast_config());
            for message in messages.clone() {
                h.manager.add_message("chat-p", message).await.unwrap();
            }
            (messages.len(), h.manager.get_messages("chat-p").await.unwrap())
        });

        prop_assert_eq!(stored.len(), count);
        for pair in stored.windows(2) {
            prop_assert_ne!(compare_messages(&pair[0], &pair[1]), Ordering::Greater);
        }
    }
}
