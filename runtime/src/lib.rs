//! # Chatsync Runtime
//!
//! Services that keep hot chat sessions in a TTL-bounded cache and write
//! every message behind to durable storage exactly once.
//!
//! ## Core Components
//!
//! - **`CacheService`**: session storage over a `CacheStore` with retry,
//!   health tracking, reconnection and batched presence/activity writes
//! - **`SessionManager`**: the append path (cold start, de-dup, cap eviction,
//!   write-through fallback) and the session lifecycle
//! - **`SyncService`**: idempotent chunked writes to a `DurableStore`
//! - **`BackgroundSyncWorker`**: periodic flush of expiring and oversized sessions
//! - **`SyncMonitor`**: combined health report and health event logging
//!
//! ## Example
//!
//! ```ignore
//! use chatsync_runtime::{CacheService, SessionManager, SyncService};
//! use chatsync_core::{MessageType, NewMessage, SyncConfig, SystemClock};
//! use std::sync::Arc;
//!
//! let config = SyncConfig::from_env();
//! let cache = Arc::new(CacheService::new(cache_store, &config));
//! let sync = Arc::new(SyncService::new(durable_store, Arc::new(SystemClock), &config));
//! let manager = SessionManager::new(cache, sync, Arc::new(SystemClock), &config);
//!
//! let outcome = manager
//!     .add_message("chat-1", NewMessage::new("alice", "hello", MessageType::User))
//!     .await?;
//! ```

/// Cache service, key layout and connection health
pub mod cache;

/// Error types for the session and sync services
pub mod error;

/// Prometheus metrics for observability
pub mod metrics;

/// Health reporting
pub mod monitor;

/// Bounded retry with linear backoff
pub mod retry;

/// Session manager
pub mod session;

/// Durable sync service
pub mod sync;

/// Background sync worker
pub mod worker;

mod locks;

pub use cache::{CacheService, ConnectionHealth, HealthEvent};
pub use error::{SessionError, SessionResult, SyncError};
pub use monitor::{HealthReport, HealthStatus, SyncMonitor};
pub use session::{AppendMode, AppendOutcome, ExpireOutcome, SessionManager};
pub use sync::{BatchSyncReport, SessionSyncReport, SyncMetricsSnapshot, SyncService};
pub use worker::{BackgroundSyncWorker, ExpireAllReport, SweepReport};
