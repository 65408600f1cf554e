//! Shared expiring key-value store.
//!
//! Sessions and conversation history live behind one small trait so every
//! gateway instance sees the same state. Two backends:
//!
//! - **Redis**: production, shared across processes. Atomic set-with-expiry
//!   and capped-list appends run server-side.
//! - **In-Memory**: single-process development and tests. Honours TTLs
//!   against an injectable [`Clock`] so expiry is deterministic in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

// ============================================================================
// Error Types
// ============================================================================

/// Shared store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not reach the backend.
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The backend rejected a command.
    #[error("Store command error: {0}")]
    Command(String),

    /// A stored value could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<StoreError> for chatgate_common::Error {
    fn from(err: StoreError) -> Self {
        Self::External(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Clock
// ============================================================================

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::milliseconds(by.as_millis() as i64);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Minimal expiring key-value capability used by sessions and conversation memory.
///
/// Every method is a single round-trip to the backend.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name, reported by health checks.
    fn name(&self) -> &str;

    /// Read a string value. Missing or expired keys yield `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value with a fresh TTL, replacing any previous value.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Append to a list, keep only the newest `cap` items and reset the list's TTL.
    async fn push_capped(&self, key: &str, value: &str, cap: usize, ttl: Duration)
        -> StoreResult<()>;

    /// Read a whole list, oldest first. Missing or expired keys yield an empty list.
    async fn list(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Debug, Clone)]
enum EntryData {
    Value(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: EntryData,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Live entries plus the earliest expiry among them.
#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    earliest_expiry: Option<DateTime<Utc>>,
}

impl Entries {
    /// Drop expired entries once the earliest known expiry has passed.
    fn sweep(&mut self, now: DateTime<Utc>) {
        if !self.earliest_expiry.is_some_and(|at| now >= at) {
            return;
        }
        self.map.retain(|_, entry| entry.is_live(now));
        self.earliest_expiry = self.map.values().map(|entry| entry.expires_at).min();
    }

    fn note_expiry(&mut self, at: DateTime<Utc>) {
        self.earliest_expiry = Some(self.earliest_expiry.map_or(at, |current| current.min(at)));
    }
}

/// Process-local store with TTL semantics matching Redis.
///
/// Expired entries are invisible to reads and are purged on the next write.
pub struct InMemoryStore {
    entries: RwLock<Entries>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            clock,
        }
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(ttl.as_millis() as i64)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.data {
                EntryData::Value(value) => Ok(Some(value.clone())),
                EntryData::List(_) => Err(StoreError::Command(format!(
                    "WRONGTYPE key {key} holds a list"
                ))),
            },
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl);
        let mut entries = self.entries.write().await;
        entries.sweep(now);

        entries.map.insert(
            key.to_string(),
            Entry {
                data: EntryData::Value(value.to_string()),
                expires_at,
            },
        );
        entries.note_expiry(expires_at);
        Ok(())
    }

    async fn push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl);
        let mut entries = self.entries.write().await;
        entries.sweep(now);

        let entry = entries
            .map
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                data: EntryData::List(VecDeque::new()),
                expires_at,
            });

        let EntryData::List(items) = &mut entry.data else {
            return Err(StoreError::Command(format!(
                "WRONGTYPE key {key} holds a value"
            )));
        };

        items.push_back(value.to_string());
        while items.len() > cap {
            items.pop_front();
        }
        entry.expires_at = expires_at;
        entries.note_expiry(expires_at);

        Ok(())
    }

    async fn list(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.data {
                EntryData::List(items) => Ok(items.iter().cloned().collect()),
                EntryData::Value(_) => Err(StoreError::Command(format!(
                    "WRONGTYPE key {key} holds a value"
                ))),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ============================================================================
// Redis Store
// ============================================================================

/// Redis-backed store shared by every gateway instance.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis. The connection manager reconnects on its own afterwards.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::info!("Redis connection established");

        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let keep_from = -(cap.max(1) as i64);

        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(keep_from)
            .arg(-1)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn list(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let items = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async::<Vec<String>>(&mut conn)
            .await?;
        Ok(items)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let response = redis::cmd("PING").query_async::<String>(&mut conn).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Command(format!("unexpected PING reply: {response}")))
        }
    }
}

/// Build the configured store backend.
pub async fn create_store(
    config: &chatgate_common::StoreConfig,
) -> StoreResult<Arc<dyn KvStore>> {
    match config.backend.as_str() {
        "memory" => {
            tracing::warn!(
                "Using in-memory store; sessions are not shared with other gateway instances"
            );
            Ok(Arc::new(InMemoryStore::new()))
        }
        _ => Ok(Arc::new(RedisStore::connect(&config.redis_url).await?)),
    }
}

// ============================================================================
// Tests
// ============================================================================
