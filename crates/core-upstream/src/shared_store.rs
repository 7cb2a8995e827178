//! Shared key-value tier behind the cache and the webhook deduplicator
//!
//! The resilience layer treats the shared store as an injected collaborator:
//! a TTL-aware KV with an atomic claim primitive (`set_nx`) and prefix
//! deletion for bulk invalidation. When no store is configured, or the
//! configured one fails, both consumers degrade to their in-process tier.
//!
//! [`InMemorySharedStore`] is the in-tree implementation used by tests and
//! single-process deployments; a Redis-backed implementation is available
//! behind the `backend-redis` feature.

use crate::error::UpstreamError;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// TTL-aware shared key-value store.
#[async_trait::async_trait]
pub trait SharedStore: Send + Sync {
    /// Fetch a value; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, UpstreamError>;

    /// Store a value with the given time-to-live.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), UpstreamError>;

    /// Atomically claim a key: store only if absent. Returns whether this
    /// caller won the claim.
    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration)
        -> Result<bool, UpstreamError>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<(), UpstreamError>;

    /// Remove every key beginning with `prefix`; returns the removal count.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, UpstreamError>;
}

/// Process-local [`SharedStore`] over a concurrent map.
#[derive(Debug, Default)]
pub struct InMemorySharedStore {
    entries: DashMap<String, (Bytes, Instant)>,
}

impl InMemorySharedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (possibly expired, not yet reaped) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, UpstreamError> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (value, expires_at) = entry.value();
                if Instant::now() < *expires_at {
                    return Ok(Some(value.clone()));
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries
                .remove_if(key, |_, (_, expires_at)| Instant::now() >= *expires_at);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), UpstreamError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, UpstreamError> {
        let expires_at = Instant::now() + ttl;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if Instant::now() >= occupied.get().1 {
                    occupied.insert((value, expires_at));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value, expires_at));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), UpstreamError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, UpstreamError> {
        let mut removed = 0u64;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

/// Redis-backed [`SharedStore`].
#[cfg(feature = "backend-redis")]
pub mod redis_store {
    use super::*;
    use redis::AsyncCommands;

    /// Shared store over a multiplexed Redis connection.
    pub struct RedisSharedStore {
        conn: redis::aio::MultiplexedConnection,
    }

    impl RedisSharedStore {
        /// Connect to the given Redis URL.
        pub async fn connect(url: &str) -> Result<Self, UpstreamError> {
            let client = redis::Client::open(url)
                .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
            let conn = client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
            Ok(Self { conn })
        }
    }

    #[async_trait::async_trait]
    impl SharedStore for RedisSharedStore {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, UpstreamError> {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = conn
                .get(key)
                .await
                .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
            Ok(value.map(Bytes::from))
        }

        async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), UpstreamError> {
            let mut conn = self.conn.clone();
            let seconds = ttl.as_secs().max(1) as usize;
            let _: () = conn
                .set_ex(key, value.as_ref(), seconds)
                .await
                .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
            Ok(())
        }

        async fn set_nx(
            &self,
            key: &str,
            value: Bytes,
            ttl: Duration,
        ) -> Result<bool, UpstreamError> {
            let mut conn = self.conn.clone();
            let seconds = ttl.as_secs().max(1);
            // SET key value NX EX seconds -> OK or nil
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value.as_ref())
                .arg("NX")
                .arg("EX")
                .arg(seconds)
                .query_async(&mut conn)
                .await
                .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
            Ok(reply.is_some())
        }

        async fn delete(&self, key: &str) -> Result<(), UpstreamError> {
            let mut conn = self.conn.clone();
            let _: () = conn
                .del(key)
                .await
                .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
            Ok(())
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<u64, UpstreamError> {
            let mut conn = self.conn.clone();
            let pattern = format!("{}*", prefix);
            let keys: Vec<String> = {
                let mut iter = conn
                    .scan_match::<_, String>(&pattern)
                    .await
                    .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                keys
            };
            if keys.is_empty() {
                return Ok(0);
            }
            let removed: u64 = conn
                .del(&keys)
                .await
                .map_err(|e| UpstreamError::SharedStore(e.to_string()))?;
            Ok(removed)
        }
    }
}
