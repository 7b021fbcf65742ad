//! Integration tests for durable sync and the background worker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use chatsync_core::{ChatSession, Clock, DateTime, Utc};
use chatsync_runtime::SessionError;
use chatsync_testing::helpers::{messages_from, new_message};
use chatsync_testing::test_time;
use common::{Harness, fast_config};
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    test_time() + chrono::Duration::seconds(secs)
}

/// Store a session holding `count` unsynced messages directly in the cache.
async fn seed_session(h: &Harness, chat_id: &str, count: usize) -> ChatSession {
    let mut session = ChatSession::new(chat_id, "alice", h.clock.now(), chrono::Duration::hours(1));
    session.messages = messages_from(at(-3600), count);
    session.sort_messages();
    h.cache.set_session(&session).await.unwrap();
    session
}

// ============================================================================
// Sync service
// ============================================================================

#[tokio::test]
async fn batch_sync_is_idempotent() {
    let h = Harness::new(fast_config().with_sync_batch_size(10));
    let messages = messages_from(at(0), 30);

    let first = h.sync.batch_sync_messages("chat-1", &messages).await.unwrap();
    assert_eq!(first.synced, 30);
    assert_eq!(first.inserted, 30);
    assert_eq!(first.chunks, 3);

    let second = h.sync.batch_sync_messages("chat-1", &messages).await.unwrap();
    assert_eq!(second.synced, 30);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 30);

    assert_eq!(h.durable.write_log().len(), 30);
    assert_eq!(h.durable.message_count("chat-1"), 30);
}

#[tokio::test]
async fn failing_chunk_is_retried_whole() {
    let h = Harness::new(fast_config().with_sync_batch_size(10));
    let messages = messages_from(at(0), 10);
    h.durable.fail_adds(2);

    let report = h.sync.batch_sync_messages("chat-1", &messages).await.unwrap();

    assert_eq!(report.synced, 10);
    assert_eq!(h.durable.message_count("chat-1"), 10);
    assert_eq!(h.sync.metrics().retries, 1);
}

#[tokio::test]
async fn exhausted_chunk_halts_and_reports_durable_prefix() {
    let h = Harness::new(fast_config().with_sync_batch_size(10));
    let messages = messages_from(at(0), 40);
    h.durable.fail_message("m25");

    let err = h
        .sync
        .batch_sync_messages("chat-1", &messages)
        .await
        .unwrap_err();

    assert_eq!(err.synced(), 20);
    assert!(h.durable.contains("m19"));
    assert!(!h.durable.contains("m25"));
    assert!(!h.durable.contains("m30"));

    let metrics = h.sync.metrics();
    assert_eq!(metrics.batches_synced, 2);
    assert_eq!(metrics.batch_failures, 1);
}

#[tokio::test]
async fn session_sync_records_metadata_and_history() {
    let h = Harness::new(fast_config());
    let session = seed_session(&h, "chat-1", 5).await;

    let report = h.sync.sync_session_to_db(&session).await.unwrap();

    assert_eq!(report.synced_ids.len(), 5);
    assert!(report.metadata_updated);
    assert!(report.history_recorded);

    let metadata = h.durable.metadata("chat-1").unwrap();
    assert_eq!(metadata.synced_message_count, 5);
    assert_eq!(metadata.last_session_id, session.session_id);

    let history = h.durable.history(&session.session_id).unwrap();
    assert_eq!(history.message_count, 5);
    assert_eq!(history.started_at, session.created_at);
    assert_eq!(h.sync.metrics().sessions_synced, 1);
    assert_eq!(h.sync.metrics().last_sync_at, Some(h.clock.now()));
}

#[tokio::test]
async fn metadata_failure_does_not_fail_session_sync() {
    let h = Harness::new(fast_config());
    let session = seed_session(&h, "chat-1", 3).await;
    h.durable.fail_metadata(true);

    let report = h.sync.sync_session_to_db(&session).await.unwrap();

    assert!(!report.metadata_updated);
    assert!(report.history_recorded);
    assert_eq!(h.durable.message_count("chat-1"), 3);
}

// ============================================================================
// Proactive (high-water) sync
// ============================================================================

#[tokio::test]
async fn append_reports_threshold_crossing() {
    let h = Harness::new(fast_config().with_max_messages(10));
    for i in 0..7 {
        let outcome = h
            .manager
            .add_message("chat-1", new_message(&format!("m{i}"), "alice", at(i)))
            .await
            .unwrap();
        assert!(!outcome.needs_background_sync);
    }

    let outcome = h
        .manager
        .add_message("chat-1", new_message("m7", "alice", at(7)))
        .await
        .unwrap();
    assert!(outcome.needs_background_sync);
    assert!(h.manager.needs_background_sync("chat-1").await.unwrap());
}

#[tokio::test]
async fn background_sync_flushes_older_half() {
    let h = Harness::new(fast_config());
    seed_session(&h, "chat-1", 800).await;
    assert!(h.manager.needs_background_sync("chat-1").await.unwrap());

    let synced = h.manager.perform_background_sync("chat-1").await.unwrap();

    assert_eq!(synced, 400);
    assert_eq!(h.durable.message_count("chat-1"), 400);
    let session = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 800);
    assert!(session.messages[..400].iter().all(|m| m.synced_to_db));
    assert!(session.messages[400..].iter().all(|m| !m.synced_to_db));

    assert_eq!(h.manager.perform_background_sync("chat-1").await.unwrap(), 0);
}

#[tokio::test]
async fn partial_background_sync_marks_only_the_durable_prefix() {
    let h = Harness::new(fast_config().with_sync_batch_size(10));
    seed_session(&h, "chat-1", 40).await;
    h.durable.fail_message("m15");

    let result = h.manager.perform_background_sync("chat-1").await;

    match result {
        Err(SessionError::Sync(e)) => assert_eq!(e.synced(), 10),
        other => panic!("expected sync failure, got {other:?}"),
    }
    let session = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(session.unsynced_count(), 30);
    assert!(session.messages[..10].iter().all(|m| m.synced_to_db));
}

// ============================================================================
// Worker sweeps
// ============================================================================

#[tokio::test]
async fn expiring_selection_uses_lookahead_window() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("soon", new_message("a0", "alice", h.clock.now()))
        .await
        .unwrap();
    h.advance_secs(90);
    h.manager
        .add_message("later", new_message("b0", "bob", h.clock.now()))
        .await
        .unwrap();
    h.durable
        .seed_messages("synced", messages_from(at(-60), 3));
    h.manager.load_session_from_db("synced").await.unwrap();

    // "soon" now expires in 30s, "later" in 120s.
    h.advance_secs(3480);

    let expiring: Vec<String> = h
        .manager
        .get_expiring_sessions()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.chat_id)
        .collect();
    assert_eq!(expiring, ["soon"]);
}

#[tokio::test]
async fn sweep_flushes_and_expires_expiring_sessions() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("soon", new_message("a0", "alice", h.clock.now()))
        .await
        .unwrap();
    h.advance_secs(90);
    h.manager
        .add_message("later", new_message("b0", "bob", h.clock.now()))
        .await
        .unwrap();
    h.advance_secs(3480);

    let (worker, _shutdown) = h.worker();
    let report = worker.run_once().await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.expire_failures, 0);
    assert_eq!(report.messages_synced, 1);
    assert!(h.durable.contains("a0"));
    assert!(h.manager.get_session("soon").await.unwrap().is_none());
    assert!(h.manager.get_session("later").await.unwrap().is_some());
}

#[tokio::test]
async fn one_failing_session_does_not_stop_the_sweep() {
    let h = Harness::new(fast_config());
    for chat in ["chat-a", "chat-b"] {
        h.manager
            .add_message(chat, new_message(&format!("{chat}-m0"), "alice", h.clock.now()))
            .await
            .unwrap();
    }
    h.durable.fail_message("chat-a-m0");
    h.advance_secs(3570);

    let (worker, _shutdown) = h.worker();
    let report = worker.run_once().await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.expire_failures, 1);
    assert!(h.manager.get_session("chat-a").await.unwrap().is_some());
    assert!(h.manager.get_session("chat-b").await.unwrap().is_none());

    h.durable.heal_message("chat-a-m0");
    let report = worker.run_once().await;
    assert_eq!(report.expired, 1);
    assert!(h.durable.contains("chat-a-m0"));
    assert!(h.manager.get_session("chat-a").await.unwrap().is_none());
}

#[tokio::test]
async fn unsynced_session_survives_outage_longer_than_key_grace() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("chat-1", new_message("m0", "alice", h.clock.now()))
        .await
        .unwrap();
    h.durable.set_available(false);
    h.advance_secs(3570);

    // 15 sweeps, 30 s apart, carry the outage well past the key TTL.
    let (worker, _shutdown) = h.worker();
    for _ in 0..15 {
        let report = worker.run_once().await;
        assert_eq!(report.expire_failures, 1);
        assert_eq!(h.cache_store.ttl_of("chat_session:chat-1"), Some(h.config.key_ttl()));
        assert_eq!(h.cache_store.ttl_of("chat_messages:chat-1"), Some(h.config.key_ttl()));
        h.advance_secs(30);
    }
    assert!(h.clock.now() > test_time() + chrono::Duration::from_std(h.config.key_ttl()).unwrap());

    h.durable.set_available(true);
    let report = worker.run_once().await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.expire_failures, 0);
    assert!(h.durable.contains("m0"));
    assert!(h.manager.get_session("chat-1").await.unwrap().is_none());
}

#[tokio::test]
async fn failed_expiry_flush_keeps_logical_expiry() {
    let h = Harness::new(fast_config());
    h.manager
        .add_message("chat-1", new_message("m0", "alice", h.clock.now()))
        .await
        .unwrap();
    let expires_at = h.manager.get_session("chat-1").await.unwrap().unwrap().expires_at;
    h.durable.set_available(false);
    h.advance_secs(3590);

    assert!(h.manager.expire_session("chat-1").await.is_err());

    let session = h.manager.get_session("chat-1").await.unwrap().unwrap();
    assert_eq!(session.expires_at, expires_at);
    assert_eq!(h.cache_store.ttl_of("chat_session:chat-1"), Some(h.config.key_ttl()));
    assert_eq!(h.manager.get_expiring_sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_runs_proactive_sync_for_high_water_sessions() {
    let h = Harness::new(fast_config());
    seed_session(&h, "busy", 800).await;
    seed_session(&h, "quiet", 10).await;

    let (worker, _shutdown) = h.worker();
    let report = worker.run_once().await;

    assert_eq!(report.background_synced, 1);
    assert_eq!(report.messages_synced, 400);
    assert_eq!(h.durable.message_count("busy"), 400);
    assert_eq!(h.durable.message_count("quiet"), 0);
}

#[tokio::test]
async fn idle_sweep_reports_idle() {
    let h = Harness::new(fast_config());
    let (worker, _shutdown) = h.worker();
    assert!(worker.run_once().await.is_idle());
}

#[tokio::test]
async fn expire_all_flushes_every_session() {
    let h = Harness::new(fast_config());
    for chat in ["chat-a", "chat-b", "chat-c"] {
        for i in 0..2 {
            h.manager
                .add_message(chat, new_message(&format!("{chat}-m{i}"), "alice", at(i)))
                .await
                .unwrap();
        }
    }

    let (worker, _shutdown) = h.worker();
    let report = worker.expire_all().await;

    assert_eq!(report.expired, 3);
    assert_eq!(report.failures, 0);
    assert_eq!(report.messages_synced, 6);
    assert!(h.manager.get_active_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_flushes_sessions_and_write_queue() {
    let h = Harness::new(fast_config().with_worker_interval(Duration::from_secs(30)));
    h.manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();
    assert!(h.cache.pending_writes() > 0);

    let (mut worker, shutdown) = h.worker();
    let handle = tokio::spawn(async move { worker.run().await });
    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop")
        .unwrap();

    assert!(h.durable.contains("m0"));
    assert!(h.manager.get_session("chat-1").await.unwrap().is_none());
    assert_eq!(h.cache.pending_writes(), 0);
}

#[tokio::test]
async fn shutdown_without_flush_leaves_sessions_cached() {
    let h = Harness::new(fast_config().with_flush_on_shutdown(false));
    h.manager
        .add_message("chat-1", new_message("m0", "alice", at(0)))
        .await
        .unwrap();

    let (mut worker, shutdown) = h.worker();
    let handle = tokio::spawn(async move { worker.run().await });
    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop")
        .unwrap();

    assert!(!h.durable.contains("m0"));
    assert!(h.manager.get_session("chat-1").await.unwrap().is_some());
}
