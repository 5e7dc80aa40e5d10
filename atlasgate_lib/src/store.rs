//! Counter store behind the downstream limiter.
//!
//! Per-secret request counts live in a store shared by every proxy instance,
//! so the fleet agrees on how many requests a caller has made this second.
//! [`CounterStore`] is the capability the limiter programs against;
//! [`RedisStore`] is the production implementation and [`MemoryStore`] a
//! single-instance stand-in that tests (and development without Redis) use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;

/// Write applied atomically at the end of a watched transaction.
pub enum TxnCommand {
    /// Bump the counter, leaving its TTL untouched.
    Incr,
    /// Seed the counter at 1 with the given time-to-live.
    SetWithTtl(Duration),
}

/// A consistent view of a counter entry, taken under WATCH.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountObservation {
    /// Current count, if the entry exists.
    pub count: Option<i64>,
    /// Milliseconds until the entry expires, if it exists and has a TTL.
    pub ttl_ms: Option<i64>,
}

/// Transaction body: observes the counter and decides what to write.
/// Returning `None` means a pure read; nothing is committed.
pub type Decide<'a> = &'a mut (dyn FnMut(CountObservation) -> Option<TxnCommand> + Send);

/// Shared atomic counter service keyed by caller secret.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Reads a plain entry.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a plain entry without expiry.
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Reachability probe with a deadline; used once at startup.
    async fn ping(&self, deadline: Duration) -> Result<(), StoreError>;

    /// Observes `key` under an optimistic transaction and atomically applies
    /// whatever `decide` returns. `Ok(false)` means the entry changed between
    /// observation and commit; the caller may retry.
    async fn watch_count(&self, key: &str, decide: Decide<'_>) -> Result<bool, StoreError>;

    /// Releases the backing connection. Called once on shutdown.
    async fn close(&self);
}

/// Connection settings for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
        }
    }
}

/// Redis-backed counter store.
///
/// Plain reads and writes go through a shared [`ConnectionManager`]. Watched
/// transactions take a dedicated connection per attempt: WATCH is
/// connection-stateful and must not interleave with other traffic.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis with the given settings.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(settings.host.clone(), settings.port),
            redis: redis::RedisConnectionInfo {
                db: settings.db,
                username: settings.username.clone(),
                password: settings.password.clone(),
            },
        };
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn ping(&self, deadline: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let command = redis::cmd("PING");
        match tokio::time::timeout(deadline, command.query_async::<_, String>(&mut conn)).await {
            Ok(reply) => {
                reply?;
                Ok(())
            }
            Err(_) => Err(StoreError::PingTimeout),
        }
    }

    async fn watch_count(&self, key: &str, decide: Decide<'_>) -> Result<bool, StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        let count: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        // PTTL reports -2 for a missing key and -1 for a key without expiry.
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        let observed = CountObservation {
            count,
            ttl_ms: (pttl >= 0).then_some(pttl),
        };
        match decide(observed) {
            Some(TxnCommand::Incr) => {
                let mut pipe = redis::pipe();
                pipe.atomic().incr(key, 1).ignore();
                let committed: Option<redis::Value> = pipe.query_async(&mut conn).await?;
                Ok(committed.is_some())
            }
            Some(TxnCommand::SetWithTtl(ttl)) => {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .cmd("SET")
                    .arg(key)
                    .arg(1)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .ignore();
                let committed: Option<redis::Value> = pipe.query_async(&mut conn).await?;
                Ok(committed.is_some())
            }
            None => {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
                Ok(true)
            }
        }
    }

    async fn close(&self) {
        // Dropping the client tears the connections down; nothing more to do.
        tracing::debug!("closing the counter store");
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process counter store with the same TTL semantics as Redis.
///
/// Single-instance only: counts are not shared across processes. Tests can
/// force the next transactions to report an optimistic conflict with
/// [`MemoryStore::inject_conflicts`].
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    forced_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` committing transactions report a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| at <= now));
        if expired {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key, Instant::now());
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn ping(&self, _deadline: Duration) -> Result<(), StoreError> {
        Ok(())
    }

    async fn watch_count(&self, key: &str, decide: Decide<'_>) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key, now);
        let observed = match entries.get(key) {
            None => CountObservation::default(),
            Some(entry) => CountObservation {
                count: entry.value.parse().ok(),
                ttl_ms: entry
                    .expires_at
                    .map(|at| at.saturating_duration_since(now).as_millis() as i64),
            },
        };
        let Some(command) = decide(observed) else {
            return Ok(true);
        };
        if self.forced_conflicts.load(Ordering::SeqCst) > 0 {
            self.forced_conflicts.fetch_sub(1, Ordering::SeqCst);
            return Ok(false);
        }
        match command {
            TxnCommand::Incr => {
                // Like Redis INCR: bumps in place without touching the TTL,
                // creating the entry at 1 if it is missing.
                match entries.get_mut(key) {
                    Some(entry) => {
                        let count: i64 = entry.value.parse().unwrap_or(0);
                        entry.value = (count + 1).to_string();
                    }
                    None => {
                        entries.insert(
                            key.to_string(),
                            Entry {
                                value: "1".to_string(),
                                expires_at: None,
                            },
                        );
                    }
                }
            }
            TxnCommand::SetWithTtl(ttl) => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(now + ttl),
                    },
                );
            }
        }
        Ok(true)
    }

    async fn close(&self) {}
}
