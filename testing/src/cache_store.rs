//! In-memory [`CacheStore`] with lazy TTLs and fault injection.

use chatsync_core::{
    BoxFuture, CacheCommand, CacheError, CacheResult, CacheStore, Clock, DateTime, StreamEntry, Utc,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    List(Vec<String>),
    Stream(Vec<StreamEntry>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct State {
    entries: HashMap<String, Entry>,
    stream_seq: u64,
}

impl State {
    fn purge(&mut self, now: DateTime<Utc>) {
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
    }
}

/// In-memory cache store for tests.
///
/// Expiry is evaluated lazily against the injected clock, so tests can move
/// time forward with a `ManualClock` and watch keys disappear.
///
/// # Fault injection
///
/// - [`set_available`](Self::set_available): server down; every call fails,
///   reconnects included
/// - [`break_connection`](Self::break_connection): server up but the
///   connection is dead; every call fails until [`CacheStore::reconnect`]
/// - [`fail_next`](Self::fail_next): the next `n` calls fail
/// - [`fail_next_pipelines`](Self::fail_next_pipelines): the next `n`
///   pipeline calls fail
///
/// `scan_keys` supports exact keys and a single trailing `*`.
pub struct InMemoryCacheStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    broken: AtomicBool,
    fail_next: AtomicUsize,
    fail_pipelines: AtomicUsize,
    operations: AtomicUsize,
    pipelines: AtomicUsize,
    reconnects: AtomicUsize,
}

impl InMemoryCacheStore {
    /// Create an empty, available store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            available: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            fail_pipelines: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
            pipelines: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    /// Simulate the server going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Kill the current connection; calls fail until `reconnect` succeeds.
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` calls of any kind.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` pipeline calls.
    pub fn fail_next_pipelines(&self, n: usize) {
        self.fail_pipelines.store(n, Ordering::SeqCst);
    }

    /// Calls made (failed ones included).
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// Pipeline calls made (failed ones included).
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.load(Ordering::SeqCst)
    }

    /// Reconnect calls made.
    #[must_use]
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Live keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.live_state().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a live key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.live_state().entries.contains_key(key)
    }

    /// Fields of a live hash.
    #[must_use]
    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        match self.live_state().entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(fields)) => Some(fields.clone()),
            _ => None,
        }
    }

    /// Elements of a live list.
    #[must_use]
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        match self.live_state().entries.get(key).map(|e| &e.value) {
            Some(Value::List(values)) => Some(values.clone()),
            _ => None,
        }
    }

    /// Length of a live stream (0 if missing).
    #[must_use]
    pub fn stream_len(&self, key: &str) -> usize {
        match self.live_state().entries.get(key).map(|e| &e.value) {
            Some(Value::Stream(entries)) => entries.len(),
            _ => 0,
        }
    }

    /// Remaining time to live of a key, if it has one.
    #[must_use]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.live_state()
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .and_then(|at| (at - now).to_std().ok())
    }

    /// Overwrite a list directly, bypassing encoding (for corruption tests).
    pub fn put_raw_list(&self, key: &str, values: Vec<String>) {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::List(values),
                expires_at: None,
            },
        );
    }

    /// Overwrite a hash directly, bypassing encoding (for corruption tests).
    pub fn put_raw_hash(&self, key: &str, fields: HashMap<String, String>) {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(fields),
                expires_at: None,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_state(&self) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.purge(self.clock.now());
        state
    }

    fn check(&self, operation: &str) -> CacheResult<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::Backend(format!("{operation}: connection refused")));
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(CacheError::Backend(format!("{operation}: broken pipe")));
        }
        if take_one(&self.fail_next) {
            return Err(CacheError::Backend(format!("{operation}: injected failure")));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Backend(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {key}"
    ))
}

fn ttl_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

fn apply(state: &mut State, command: CacheCommand, now: DateTime<Utc>) -> CacheResult<()> {
    match command {
        CacheCommand::HashSet { key, fields } => hash_set(state, &key, fields),
        CacheCommand::ListPush { key, values } => list_push(state, &key, values).map(|_| ()),
        CacheCommand::StreamAppend {
            key,
            fields,
            max_len,
        } => stream_append(state, &key, fields, max_len, now).map(|_| ()),
        CacheCommand::Expire { key, ttl } => {
            expire(state, &key, ttl, now);
            Ok(())
        }
        CacheCommand::Delete { keys } => {
            delete(state, &keys);
            Ok(())
        }
    }
}

fn hash_set(state: &mut State, key: &str, fields: Vec<(String, String)>) -> CacheResult<()> {
    let entry = state.entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Hash(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Hash(existing) => {
            existing.extend(fields);
            Ok(())
        }
        _ => Err(wrong_type(key)),
    }
}

fn list_push(state: &mut State, key: &str, values: Vec<String>) -> CacheResult<usize> {
    let entry = state.entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::List(Vec::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::List(list) => {
            list.extend(values);
            Ok(list.len())
        }
        _ => Err(wrong_type(key)),
    }
}

fn stream_append(
    state: &mut State,
    key: &str,
    fields: Vec<(String, String)>,
    max_len: Option<usize>,
    now: DateTime<Utc>,
) -> CacheResult<String> {
    state.stream_seq += 1;
    let id = format!("{}-{}", now.timestamp_millis(), state.stream_seq);
    let entry = state.entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Stream(Vec::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Stream(entries) => {
            entries.push(StreamEntry {
                id: id.clone(),
                fields,
            });
            if let Some(max) = max_len {
                let excess = entries.len().saturating_sub(max);
                entries.drain(..excess);
            }
            Ok(id)
        }
        _ => Err(wrong_type(key)),
    }
}

fn expire(state: &mut State, key: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
    match state.entries.get_mut(key) {
        Some(entry) => {
            entry.expires_at = Some(ttl_deadline(now, ttl));
            true
        }
        None => false,
    }
}

fn delete(state: &mut State, keys: &[String]) -> usize {
    keys.iter()
        .filter(|key| state.entries.remove(key.as_str()).is_some())
        .count()
}

fn matches(pattern: &str, key: &str) -> bool {
    pattern
        .strip_suffix('*')
        .map_or(pattern == key, |prefix| key.starts_with(prefix))
}

impl CacheStore for InMemoryCacheStore {
    fn hash_set(&self, key: &str, fields: Vec<(String, String)>) -> BoxFuture<'_, CacheResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check("hset")?;
            hash_set(&mut self.live_state(), &key, fields)
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
            self.check("hupdate")?;
            let now = self.clock.now();
            let mut state = self.live_state();
            if !state.entries.contains_key(&key) {
                return Ok(false);
            }
            hash_set(&mut state, &key, fields)?;
            if let Some(ttl) = ttl {
                expire(&mut state, &key, ttl, now);
            }
            Ok(true)
        })
    }

    fn hash_get_all(&self, key: &str) -> BoxFuture<'_, CacheResult<HashMap<String, String>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check("hgetall")?;
            match self.live_state().entries.get(&key).map(|e| &e.value) {
                None => Ok(HashMap::new()),
                Some(Value::Hash(fields)) => Ok(fields.clone()),
                Some(_) => Err(wrong_type(&key)),
            }
        })
    }

    fn list_push(&self, key: &str, values: Vec<String>) -> BoxFuture<'_, CacheResult<usize>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check("rpush")?;
            list_push(&mut self.live_state(), &key, values)
        })
    }

    fn list_range(&self, key: &str, start: isize, stop: isize) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check("lrange")?;
            let state = self.live_state();
            let list = match state.entries.get(&key).map(|e| &e.value) {
                None => return Ok(Vec::new()),
                Some(Value::List(list)) => list,
                Some(_) => return Err(wrong_type(&key)),
            };

            let len = isize::try_from(list.len()).unwrap_or(isize::MAX);
            let resolve = |i: isize| if i < 0 { len + i } else { i };
            let from = resolve(start).max(0);
            let to = resolve(stop).min(len - 1);
            if from > to {
                return Ok(Vec::new());
            }
            let from = usize::try_from(from).unwrap_or(0);
            let to = usize::try_from(to).unwrap_or(0);
            Ok(list[from..=to].to_vec())
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
            self.check("xadd")?;
            let now = self.clock.now();
            stream_append(&mut self.live_state(), &key, fields, max_len, now)
        })
    }

    fn stream_range(&self, key: &str, count: usize) -> BoxFuture<'_, CacheResult<Vec<StreamEntry>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check("xrevrange")?;
            match self.live_state().entries.get(&key).map(|e| &e.value) {
                None => Ok(Vec::new()),
                Some(Value::Stream(entries)) => {
                    let skip = entries.len().saturating_sub(count);
                    Ok(entries[skip..].to_vec())
                }
                Some(_) => Err(wrong_type(&key)),
            }
        })
    }

    fn scan_keys(&self, pattern: &str) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            self.check("scan")?;
            let mut keys: Vec<String> = self
                .live_state()
                .entries
                .keys()
                .filter(|key| matches(&pattern, key))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, CacheResult<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check("expire")?;
            let now = self.clock.now();
            Ok(expire(&mut self.live_state(), &key, ttl, now))
        })
    }

    fn delete(&self, keys: Vec<String>) -> BoxFuture<'_, CacheResult<usize>> {
        Box::pin(async move {
            self.check("del")?;
            Ok(delete(&mut self.live_state(), &keys))
        })
    }

    fn ping(&self) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move { self.check("ping") })
    }

    fn pipeline(&self, commands: Vec<CacheCommand>, atomic: bool) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move {
            self.pipelines.fetch_add(1, Ordering::SeqCst);
            self.check("pipeline")?;
            if take_one(&self.fail_pipelines) {
                return Err(CacheError::Backend("pipeline: injected failure".to_string()));
            }

            let now = self.clock.now();
            let mut state = self.live_state();
            if atomic {
                let mut staged = state.clone();
                for command in commands {
                    apply(&mut staged, command, now)?;
                }
                *state = staged;
            } else {
                for command in commands {
                    apply(&mut state, command, now)?;
                }
            }
            Ok(())
        })
    }

    fn reconnect(&self) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if !self.available.load(Ordering::SeqCst) {
                return Err(CacheError::Backend("reconnect: connection refused".to_string()));
            }
            self.broken.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl std::fmt::Debug for InMemoryCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCacheStore")
            .field("keys", &self.lock().entries.len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
