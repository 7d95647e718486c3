//! Two-tier cache: a bounded in-process LRU in front of an optional Redis.
//!
//! The cache never fails its callers. Remote errors are logged and treated
//! as misses, so a Redis outage only costs extra lookups.

use crate::traits::Cache;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_CAPACITY: usize = 2000;

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct TieredCache {
    local: Mutex<LruCache<String, Entry>>,
    local_ttl: Duration,
    remote: Option<redis::Client>,
}

impl TieredCache {
    /// In-process tier only.
    pub fn local_only(capacity: usize, local_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            local: Mutex::new(LruCache::new(capacity)),
            local_ttl,
            remote: None,
        }
    }

    /// In-process tier backed by Redis at `address` (`host:port` or a
    /// `redis://` URL).
    pub fn with_redis(
        capacity: usize,
        local_ttl: Duration,
        address: &str,
    ) -> redis::RedisResult<Self> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{}", address)
        };
        let client = redis::Client::open(url)?;
        let mut cache = Self::local_only(capacity, local_ttl);
        cache.remote = Some(client);
        Ok(cache)
    }

    fn get_local(&self, key: &str) -> Option<String> {
        let mut local = self.local.lock();
        match local.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                local.pop(key);
                None
            }
            None => None,
        }
    }

    fn set_local(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = Instant::now() + ttl.min(self.local_ttl);
        self.local.lock().put(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    async fn get_remote(&self, client: &redis::Client, key: &str) -> Option<String> {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "redis unavailable");
                return None;
            }
        };
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key = %key, error = %e, "redis get failed");
                None
            }
        }
    }

    async fn set_remote(&self, client: &redis::Client, key: &str, value: &str, ttl: Duration) {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "redis unavailable");
                return;
            }
        };
        let seconds = ttl.as_secs().max(1);
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, seconds).await {
            debug!(key = %key, error = %e, "redis set failed");
        }
    }
}

#[async_trait]
impl Cache for TieredCache {
    async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.get_local(key) {
            return Some(value);
        }
        let client = self.remote.as_ref()?;
        let value = self.get_remote(client, key).await?;
        self.set_local(key, &value, self.local_ttl);
        Some(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.set_local(key, value, ttl);
        if let Some(client) = &self.remote {
            self.set_remote(client, key, value, ttl).await;
        }
    }
}
