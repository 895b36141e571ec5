//! Sliding-window timestamp stores
//!
//! A store owns the per-key timestamp sets. `hit` must prune, count, insert
//! and refresh the key's TTL as one atomic step from the caller's point of
//! view, and return the count observed *before* the insertion.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Purge expired in-process windows every this many hits
const PURGE_EVERY: u64 = 1024;
/// Bound on a Redis connect or round-trip, so an outage fails fast
const REDIS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("{0}")]
    Unavailable(String),
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record a hit at `now_ms` and return how many earlier hits fall in
    /// `[now_ms - window_ms, now_ms]`.
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError>;

    fn name(&self) -> &'static str;
}

/// Shared store backed by Redis sorted sets (score = timestamp in ms).
///
/// The connection manager re-establishes the link after Redis restarts or
/// network drops; requests made while it is down fail with `StoreError`.
pub struct RedisWindowStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisWindowStore {
    /// Parse the URL; the connection itself is opened lazily on first use.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
        })
    }

    /// A handle to the shared managed connection. A failed first connect
    /// leaves the cell empty, so the next call tries again.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| {
                let config = ConnectionManagerConfig::new()
                    .set_number_of_retries(1)
                    .set_connection_timeout(REDIS_TIMEOUT)
                    .set_response_timeout(REDIS_TIMEOUT);
                ConnectionManager::new_with_config(self.client.clone(), config)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let cutoff = now_ms - window_ms;
        // Two hits in the same millisecond must stay distinct members
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple());

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(key, "-inf", format!("({}", cutoff))
            .ignore()
            .zcard(key)
            .zadd(key, member, now_ms)
            .ignore()
            .pexpire(key, window_ms * 2)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[derive(Default)]
struct LocalWindow {
    stamps: VecDeque<i64>,
    expires_at_ms: i64,
}

/// Single-process store for deployments without Redis and for tests.
/// Counters are not shared between gateway instances.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, LocalWindow>,
    hits: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(&self, now_ms: i64) {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.expires_at_ms > now_ms);
        let purged = before.saturating_sub(self.windows.len());
        if purged > 0 {
            log::debug!("[RATE_LIMIT] Purged {} idle windows", purged);
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError> {
        let count = {
            let mut window = self.windows.entry(key.to_string()).or_default();
            let cutoff = now_ms - window_ms;
            while window.stamps.front().is_some_and(|&t| t < cutoff) {
                window.stamps.pop_front();
            }
            let count = window.stamps.len() as u64;
            window.stamps.push_back(now_ms);
            window.expires_at_ms = now_ms + window_ms * 2;
            count
        };

        if self.hits.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now_ms);
        }

        Ok(count)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_counts_before_insert() {
        let store = MemoryWindowStore::new();
        assert_eq!(store.hit("k", 1_000, 60_000).await.unwrap(), 0);
        assert_eq!(store.hit("k", 1_001, 60_000).await.unwrap(), 1);
        assert_eq!(store.hit("k", 1_001, 60_000).await.unwrap(), 2);
        assert_eq!(store.hit("other", 1_001, 60_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_prunes_old_hits() {
        let store = MemoryWindowStore::new();
        store.hit("k", 0, 60_000).await.unwrap();
        store.hit("k", 30_000, 60_000).await.unwrap();
        // The hit at 0 has left the window, the one at 30s has not
        assert_eq!(store.hit("k", 60_001, 60_000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_purges_idle_keys() {
        let store = MemoryWindowStore::new();
        store.hit("idle", 0, 1_000).await.unwrap();
        store.purge_expired(10_000);
        assert!(store.windows.get("idle").is_none());
    }

    #[test]
    fn test_redis_store_rejects_bad_url() {
        assert!(RedisWindowStore::open("not a url").is_err());
    }

    #[tokio::test]
    async fn test_redis_outage_is_retried_not_cached() {
        // Nothing listens on port 1
        let store = RedisWindowStore::open("redis://127.0.0.1:1/").unwrap();

        assert!(store.hit("k", 0, 60_000).await.is_err());
        assert!(store.conn.get().is_none());

        // A later call attempts a fresh connection instead of reusing a dead one
        assert!(store.hit("k", 1, 60_000).await.is_err());
        assert!(store.conn.get().is_none());
    }
}
