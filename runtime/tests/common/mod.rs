//! Shared wiring for the runtime integration tests.

#![allow(dead_code)]

use chatsync_core::{CacheStore, Clock, DurableStore, SyncConfig};
use chatsync_runtime::{BackgroundSyncWorker, CacheService, SessionManager, SyncService};
use chatsync_testing::{InMemoryCacheStore, InMemoryDurableStore, ManualClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Defaults with millisecond retry and reconnect delays.
pub fn fast_config() -> SyncConfig {
    SyncConfig::default()
        .with_cache_retry(3, Duration::from_millis(1))
        .with_sync_retry(3, Duration::from_millis(1))
        .with_reconnect(3, 3, Duration::from_millis(1))
}

/// Every service wired over in-memory stores and one manual clock.
pub struct Harness {
    pub config: SyncConfig,
    pub clock: Arc<ManualClock>,
    pub cache_store: Arc<InMemoryCacheStore>,
    pub durable: Arc<InMemoryDurableStore>,
    pub cache: Arc<CacheService>,
    pub sync: Arc<SyncService>,
    pub manager: Arc<SessionManager>,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        chatsync_testing::helpers::init_tracing();

        let clock = Arc::new(ManualClock::default());
        let cache_store = Arc::new(InMemoryCacheStore::new(clock.clone()));
        let durable = Arc::new(InMemoryDurableStore::new());

        let cache = Arc::new(
            CacheService::new(cache_store.clone() as Arc<dyn CacheStore>, &config)
                .with_clock(clock.clone() as Arc<dyn Clock>),
        );
        let sync = Arc::new(SyncService::new(
            durable.clone() as Arc<dyn DurableStore>,
            clock.clone(),
            &config,
        ));
        let manager = Arc::new(SessionManager::new(
            cache.clone(),
            sync.clone(),
            clock.clone(),
            &config,
        ));

        Self {
            config,
            clock,
            cache_store,
            durable,
            cache,
            sync,
            manager,
        }
    }

    pub fn worker(&self) -> (BackgroundSyncWorker, watch::Sender<bool>) {
        BackgroundSyncWorker::new(
            self.manager.clone(),
            self.sync.clone(),
            self.cache.clone(),
            &self.config,
        )
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}
