//! Remote cache store contract.
//!
//! This module defines the primitives the cache service needs from a remote
//! key-value store: hashes, lists, streams, key scans, expiry, ping and a
//! pipeline/batch primitive.
//!
//! # Implementations
//!
//! - `RedisCacheStore` (in `chatsync-redis`): production implementation
//! - `InMemoryCacheStore` (in `chatsync-testing`): deterministic tests with fault injection
//!
//! Implementations report every failure as a single-attempt error; retry,
//! backoff and health tracking are the cache service's job.
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures instead of `async fn` so the services can hold
//! an `Arc<dyn CacheStore>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed, sendable future returned by the store contracts.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// All retries against the remote cache were exhausted.
    #[error("Cache unavailable during {operation} after {attempts} attempts: {reason}")]
    Unavailable {
        /// Operation that failed
        operation: String,
        /// Attempts made before giving up
        attempts: usize,
        /// Last backend error
        reason: String,
    },

    /// A stored value could not be parsed.
    #[error("Corrupt cache value at {key}: {reason}")]
    DataCorruption {
        /// Key holding the malformed value
        key: String,
        /// Parse failure
        reason: String,
    },

    /// Encoding a value for storage failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A single store call failed (connection refused, timeout, protocol error).
    #[error("Cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Whether retrying the same call can succeed.
    ///
    /// Corrupt data and encoding failures are deterministic and never retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Unavailable { .. })
    }

    /// Whether this is the typed `CacheUnavailable` failure.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// One write queued into a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    /// `HSET key field value [field value ...]`
    HashSet {
        /// Hash key
        key: String,
        /// Field/value pairs to set
        fields: Vec<(String, String)>,
    },
    /// `RPUSH key value [value ...]`
    ListPush {
        /// List key
        key: String,
        /// Values appended in order
        values: Vec<String>,
    },
    /// `XADD key [MAXLEN ~ n] * field value [...]`
    StreamAppend {
        /// Stream key
        key: String,
        /// Entry fields
        fields: Vec<(String, String)>,
        /// Approximate cap on stream length
        max_len: Option<usize>,
    },
    /// `EXPIRE key seconds`
    Expire {
        /// Key to expire
        key: String,
        /// Time to live
        ttl: Duration,
    },
    /// `DEL key [key ...]`
    Delete {
        /// Keys to delete
        keys: Vec<String>,
    },
}

impl CacheCommand {
    /// Command name, used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HashSet { .. } => "hset",
            Self::ListPush { .. } => "rpush",
            Self::StreamAppend { .. } => "xadd",
            Self::Expire { .. } => "expire",
            Self::Delete { .. } => "del",
        }
    }
}

/// One stream entry: server-assigned id plus fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry id (e.g. `1700000000000-0`)
    pub id: String,
    /// Field/value pairs in insertion order
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Look up a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Remote cache store abstraction.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared process-wide.
pub trait CacheStore: Send + Sync {
    /// Set fields on a hash, creating it if needed.
    fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> BoxFuture<'_, CacheResult<()>>;

    /// Set fields on a hash only if it already exists, re-applying `ttl`
    /// when given, as one atomic step.
    ///
    /// Returns `false` and writes nothing if the key is missing.
    fn hash_update(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, CacheResult<bool>>;

    /// Read every field of a hash. A missing key yields an empty map.
    fn hash_get_all(&self, key: &str) -> BoxFuture<'_, CacheResult<HashMap<String, String>>>;

    /// Right-push values onto a list. Returns the new list length.
    fn list_push(&self, key: &str, values: Vec<String>) -> BoxFuture<'_, CacheResult<usize>>;

    /// Read a list range (inclusive, negative indices count from the end).
    fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> BoxFuture<'_, CacheResult<Vec<String>>>;

    /// Append a stream entry. Returns the assigned entry id.
    fn stream_append(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        max_len: Option<usize>,
    ) -> BoxFuture<'_, CacheResult<String>>;

    /// Read the newest `count` stream entries, oldest first.
    fn stream_range(&self, key: &str, count: usize) -> BoxFuture<'_, CacheResult<Vec<StreamEntry>>>;

    /// List keys matching a glob pattern.
    fn scan_keys(&self, pattern: &str) -> BoxFuture<'_, CacheResult<Vec<String>>>;

    /// Set a key's time to live. Returns `false` if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, CacheResult<bool>>;

    /// Delete keys. Returns how many existed.
    fn delete(&self, keys: Vec<String>) -> BoxFuture<'_, CacheResult<usize>>;

    /// Round-trip health check.
    fn ping(&self) -> BoxFuture<'_, CacheResult<()>>;

    /// Execute commands in one round trip; `atomic` wraps them in a transaction.
    fn pipeline(&self, commands: Vec<CacheCommand>, atomic: bool)
    -> BoxFuture<'_, CacheResult<()>>;

    /// Drop the current connection and establish a new one.
    fn reconnect(&self) -> BoxFuture<'_, CacheResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(CacheError::Backend("refused".into()).is_retryable());
        assert!(
            !CacheError::DataCorruption {
                key: "k".into(),
                reason: "bad json".into()
            }
            .is_retryable()
        );
        assert!(!CacheError::Serialization("x".into()).is_retryable());
    }

    #[test]
    fn stream_entry_field_lookup() {
        let entry = StreamEntry {
            id: "1-0".into(),
            fields: vec![("user".into(), "alice".into()), ("kind".into(), "view".into())],
        };
        assert_eq!(entry.field("kind"), Some("view"));
        assert_eq!(entry.field("missing"), None);
    }
}
