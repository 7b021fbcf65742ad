//! `PostgreSQL` durable message store for the chat session cache.
//!
//! Implements the `DurableStore` contract from `chatsync-core`:
//!
//! - id-keyed, duplicate-safe message inserts (`ON CONFLICT DO NOTHING`)
//! - newest-first paginated reads with `before_id` anchors
//! - accumulated per-chat sync bookkeeping
//! - per-session history records
//!
//! # Example
//!
//! ```no_run
//! use chatsync_postgres::PostgresDurableStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresDurableStore::connect("postgres://localhost/chat", 10).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

mod message_store;

pub use message_store::PostgresDurableStore;
