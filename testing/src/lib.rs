//! # Chatsync Testing
//!
//! Test doubles and fixtures for the chat session cache.
//!
//! ## Contents
//!
//! - [`InMemoryCacheStore`]: cache store with lazy TTLs and fault injection
//! - [`InMemoryDurableStore`]: idempotent durable store with fault injection
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//! - [`helpers`]: message builders
//! - [`properties`]: proptest strategies
//!
//! ## Example
//!
//! ```
//! use chatsync_testing::{InMemoryCacheStore, ManualClock};
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::default());
//! let store = InMemoryCacheStore::new(clock.clone());
//! store.break_connection();
//! ```

mod cache_store;
mod durable_store;

pub use cache_store::InMemoryCacheStore;
pub use durable_store::{InMemoryDurableStore, StoredChatMetadata};

/// Mock implementations for testing
pub mod mocks {
    use chatsync_core::{Clock, DateTime, Utc};
    use std::sync::{Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Share it as `Arc<ManualClock>` between the services under test and the
    /// test body, then [`advance`](Self::advance) it to cross expiry windows.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }

        /// Move forward by `delta`.
        pub fn advance(&self, delta: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_time())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// 2025-01-01T00:00:00Z
    #[must_use]
    #[allow(clippy::expect_used)] // Test helper with hardcoded valid timestamp
    pub fn test_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded RFC3339 timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// Create a fixed clock at 2025-01-01T00:00:00Z
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_time())
    }
}

/// Message builders
pub mod helpers {
    use chatsync_core::{DateTime, MessageData, MessageType, NewMessage, Utc};

    /// Unsynced user message from `user_id` at `at`.
    #[must_use]
    pub fn message(id: &str, user_id: &str, at: DateTime<Utc>) -> MessageData {
        new_message(id, user_id, at).into_message(at)
    }

    /// Append request with a fixed id and timestamp.
    #[must_use]
    pub fn new_message(id: &str, user_id: &str, at: DateTime<Utc>) -> NewMessage {
        NewMessage::new(user_id, format!("message {id}"), MessageType::User)
            .with_id(id)
            .with_timestamp(at)
    }

    /// `count` unsynced messages `m0..`, one second apart starting at `start`,
    /// alternating between `alice` and `bob`.
    #[must_use]
    pub fn messages_from(start: DateTime<Utc>, count: usize) -> Vec<MessageData> {
        (0..count)
            .map(|i| {
                let user = if i % 2 == 0 { "alice" } else { "bob" };
                let offset = i64::try_from(i).unwrap_or(i64::MAX);
                message(&format!("m{i}"), user, start + chrono::Duration::seconds(offset))
            })
            .collect()
    }

    /// Install a test tracing subscriber honoring `RUST_LOG`. Safe to call
    /// from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing strategies
pub mod properties {
    use crate::mocks::test_time;
    use chatsync_core::{MessageType, NewMessage};
    use proptest::prelude::*;

    /// Any message role.
    pub fn message_type() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::User),
            Just(MessageType::Assistant),
            Just(MessageType::System),
        ]
    }

    /// Append requests with unique ids and timestamps clustered within a few
    /// seconds of the test epoch, so same-timestamp ties are common.
    pub fn new_messages(max: usize) -> impl Strategy<Value = Vec<NewMessage>> {
        prop::collection::vec((0_i64..5, message_type()), 1..=max).prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (secs, message_type))| {
                    NewMessage::new("alice", "text", message_type)
                        .with_id(format!("p{i:03}"))
                        .with_timestamp(test_time() + chrono::Duration::seconds(secs))
                })
                .collect()
        })
    }
}

pub use mocks::{FixedClock, ManualClock, test_clock, test_time};
