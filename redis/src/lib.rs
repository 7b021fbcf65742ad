//! Redis cache store for the chat session cache.
//!
//! Implements the `CacheStore` contract from `chatsync-core` on top of a
//! multiplexed [`ConnectionManager`]:
//!
//! - hashes and lists for session metadata and messages
//! - streams (`XADD ... MAXLEN ~`) for activity
//! - cursor `SCAN` for session discovery
//! - `MULTI`/`EXEC` pipelines for atomic session writes
//!
//! Every method makes exactly one attempt. Retry, backoff and health
//! tracking belong to the cache service.
//!
//! # Example
//!
//! ```no_run
//! use chatsync_redis::RedisCacheStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisCacheStore::connect("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

use chatsync_core::{BoxFuture, CacheCommand, CacheError, CacheResult, CacheStore, StreamEntry};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Pipeline};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 200;

/// Redis-backed [`CacheStore`].
pub struct RedisCacheStore {
    client: Client,
    conn: RwLock<ConnectionManager>,
}

impl RedisCacheStore {
    /// Open a client and establish the managed connection.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> CacheResult<Self> {
        let client = Client::open(redis_url).map_err(backend)?;
        let manager = ConnectionManager::new(client.clone()).await.map_err(backend)?;
        tracing::info!("Connected to Redis");
        Ok(Self {
            client,
            conn: RwLock::new(manager),
        })
    }

    async fn connection(&self) -> ConnectionManager {
        self.conn.read().await.clone()
    }
}

fn backend(e: redis::RedisError) -> CacheError {
    CacheError::Backend(e.to_string())
}

fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

fn xadd(key: &str, fields: &[(String, String)], max_len: Option<usize>) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(key);
    if let Some(max_len) = max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*");
    for (field, value) in fields {
        cmd.arg(field).arg(value);
    }
    cmd
}

// HSET only when the key exists; ARGV[1] is the TTL in seconds (0 keeps it).
const HASH_UPDATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if #ARGV > 1 then
    redis.call('HSET', KEYS[1], unpack(ARGV, 2))
end
local ttl = tonumber(ARGV[1])
if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
end
return 1
";

fn queue(pipe: &mut Pipeline, command: &CacheCommand) {
    match command {
        CacheCommand::HashSet { key, fields } => {
            if !fields.is_empty() {
                pipe.hset_multiple(key, fields).ignore();
            }
        }
        CacheCommand::ListPush { key, values } => {
            if !values.is_empty() {
                pipe.rpush(key, values).ignore();
            }
        }
        CacheCommand::StreamAppend {
            key,
            fields,
            max_len,
        } => {
            pipe.add_command(xadd(key, fields, *max_len)).ignore();
        }
        CacheCommand::Expire { key, ttl } => {
            pipe.expire(key, ttl_seconds(*ttl)).ignore();
        }
        CacheCommand::Delete { keys } => {
            if !keys.is_empty() {
                pipe.del(keys).ignore();
            }
        }
    }
}

impl CacheStore for RedisCacheStore {
    fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> BoxFuture<'_, CacheResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            if fields.is_empty() {
                return Ok(());
            }
            let mut conn = self.connection().await;
            let (): () = conn.hset_multiple(&key, &fields).await.map_err(backend)?;
            Ok(())
        })
    }

    fn hash_update(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, CacheResult<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let script = redis::Script::new(HASH_UPDATE_SCRIPT);
            let mut invocation = script.prepare_invoke();
            invocation.key(&key).arg(ttl.map_or(0, ttl_seconds));
            for (field, value) in &fields {
                invocation.arg(field).arg(value);
            }

            let mut conn = self.connection().await;
            let updated: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
            Ok(updated == 1)
        })
    }

    fn hash_get_all(&self, key: &str) -> BoxFuture<'_, CacheResult<HashMap<String, String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await;
            conn.hgetall(&key).await.map_err(backend)
        })
    }

    fn list_push(&self, key: &str, values: Vec<String>) -> BoxFuture<'_, CacheResult<usize>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await;
            conn.rpush(&key, &values).await.map_err(backend)
        })
    }

    fn list_range(&self, key: &str, start: isize, stop: isize) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await;
            conn.lrange(&key, start, stop).await.map_err(backend)
        })
    }

    fn stream_append(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        max_len: Option<usize>,
    ) -> BoxFuture<'_, CacheResult<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await;
            xadd(&key, &fields, max_len)
                .query_async(&mut conn)
                .await
                .map_err(backend)
        })
    }

    fn stream_range(&self, key: &str, count: usize) -> BoxFuture<'_, CacheResult<Vec<StreamEntry>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await;
            let raw: Vec<(String, Vec<String>)> = redis::cmd("XREVRANGE")
                .arg(&key)
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

            Ok(raw
                .into_iter()
                .rev()
                .map(|(id, flat)| {
                    let fields = flat
                        .chunks_exact(2)
                        .map(|pair| (pair[0].clone(), pair[1].clone()))
                        .collect();
                    StreamEntry { id, fields }
                })
                .collect())
        })
    }

    fn scan_keys(&self, pattern: &str) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await;
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            // SCAN may return a key more than once.
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, CacheResult<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await;
            conn.expire(&key, ttl_seconds(ttl)).await.map_err(backend)
        })
    }

    fn delete(&self, keys: Vec<String>) -> BoxFuture<'_, CacheResult<usize>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.connection().await;
            conn.del(&keys).await.map_err(backend)
        })
    }

    fn ping(&self) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move {
            let mut conn = self.connection().await;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            Ok(())
        })
    }

    fn pipeline(&self, commands: Vec<CacheCommand>, atomic: bool) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move {
            if commands.is_empty() {
                return Ok(());
            }
            let mut pipe = redis::pipe();
            if atomic {
                pipe.atomic();
            }
            for command in &commands {
                queue(&mut pipe, command);
            }

            let mut conn = self.connection().await;
            let (): () = pipe.query_async(&mut conn).await.map_err(backend)?;
            tracing::trace!(commands = commands.len(), atomic, "Pipeline executed");
            Ok(())
        })
    }

    fn reconnect(&self) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move {
            let manager = ConnectionManager::new(self.client.clone())
                .await
                .map_err(backend)?;
            *self.conn.write().await = manager;
            tracing::info!("Redis connection re-established");
            Ok(())
        })
    }
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("client", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_at_least_one_second() {
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(3900)), 3900);
    }

    #[test]
    fn xadd_caps_stream_length() {
        let cmd = xadd("chat_activity:c", &[("kind".into(), "view".into())], Some(1000));
        let args: Vec<String> = cmd
            .args_iter()
            .filter_map(|arg| match arg {
                redis::Arg::Simple(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                redis::Arg::Cursor => None,
            })
            .collect();
        assert_eq!(
            args,
            ["XADD", "chat_activity:c", "MAXLEN", "~", "1000", "*", "kind", "view"]
        );
    }
}
