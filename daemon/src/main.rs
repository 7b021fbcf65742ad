//! Chat session cache daemon.
//!
//! Connects Redis and `PostgreSQL`, starts the cache flush loop, the health
//! monitor, the background sync worker and the Prometheus endpoint, then
//! runs until Ctrl+C.
//!
//! # Environment Variables
//!
//! - `REDIS_URL`: cache connection (default `redis://127.0.0.1:6379`)
//! - `DATABASE_URL`: durable store connection
//! - `DATABASE_MAX_CONNECTIONS`: pool size (default 10)
//! - `RUN_MIGRATIONS`: apply schema migrations at startup (default true)
//! - `METRICS_ADDR`: Prometheus endpoint (default `0.0.0.0:9090`)
//! - `CHATSYNC_*`: session and sync tuning, see `SyncConfig::from_env`
//! - `RUST_LOG`: log filter

mod config;

use anyhow::Context;
use chatsync_core::{Clock, SystemClock};
use chatsync_postgres::PostgresDurableStore;
use chatsync_redis::RedisCacheStore;
use chatsync_runtime::metrics::MetricsServer;
use chatsync_runtime::{BackgroundSyncWorker, CacheService, SessionManager, SyncMonitor, SyncService};
use config::Config;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatsync_runtime=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        session_ttl_secs = config.sync.session_ttl_secs,
        max_messages = config.sync.max_messages,
        worker_interval_secs = config.sync.worker_interval_secs,
        "Starting chatsync daemon"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start().context("Failed to start metrics endpoint")?;

    let cache_store = RedisCacheStore::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let durable_store = PostgresDurableStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    if config.run_migrations {
        durable_store.migrate().await.context("Failed to apply migrations")?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(CacheService::new(Arc::new(cache_store), &config.sync).with_clock(Arc::clone(&clock)));
    cache.initialize().await.context("Cache did not answer PING")?;

    let sync = Arc::new(SyncService::new(Arc::new(durable_store), Arc::clone(&clock), &config.sync));
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&cache),
        Arc::clone(&sync),
        clock,
        &config.sync,
    ));
    let monitor = SyncMonitor::new(Arc::clone(&cache), Arc::clone(&sync));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_loop = Arc::clone(&cache).spawn_flush_loop(shutdown_rx.clone());
    let health_monitor = Arc::clone(&cache).spawn_health_monitor(shutdown_rx.clone());
    let event_logger = monitor.spawn_event_logger(shutdown_rx);

    let (mut worker, worker_shutdown) = BackgroundSyncWorker::new(manager, sync, cache, &config.sync);
    let worker_handle = tokio::spawn(async move { worker.run().await });

    tracing::info!(metrics_addr = %config.metrics_addr, "Daemon ready");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown signal received");

    // The worker flushes sessions first; the cache loops drain afterwards.
    let _ = worker_shutdown.send(true);
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "Background sync worker panicked");
    }

    let _ = shutdown_tx.send(true);
    for (name, handle) in [
        ("flush_loop", flush_loop),
        ("health_monitor", health_monitor),
        ("event_logger", event_logger),
    ] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "Task panicked during shutdown");
        }
    }

    let report = monitor.report();
    tracing::info!(
        status = ?report.status,
        pending_writes = report.pending_writes,
        report = %serde_json::to_string(&report).unwrap_or_default(),
        "Shutdown complete"
    );
    Ok(())
}
