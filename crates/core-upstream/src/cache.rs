//! Two-tier read-through cache for upstream resources
//!
//! The in-process tier answers hot reads with zero I/O; the optional shared
//! tier (behind [`SharedStore`]) keeps processes consistent and survives
//! restarts. The local tier is always the shorter-lived mirror: its TTL is
//! clamped to never exceed the shared tier's.
//!
//! Keys are structured (`{tenant}:{resource}[:{id}[:{sub}]]`) so whole
//! tenants or whole resource families can be invalidated by prefix after a
//! mutation. Concurrent misses for the same key collapse into a single
//! fetch via a per-key flight lock; losers wait and then hit the freshly
//! populated tier instead of stampeding the upstream.
//!
//! A failing shared tier is treated as a miss and logged — the caller never
//! sees a cache-infrastructure error.

use crate::error::UpstreamError;
use crate::shared_store::SharedStore;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Structured cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Tenant identifier
    pub tenant: String,
    /// Resource family, e.g. `products`
    pub resource: String,
    /// Optional resource id
    pub id: Option<String>,
    /// Optional sub-resource, e.g. `variants`
    pub sub_resource: Option<String>,
}

impl CacheKey {
    /// Key for a resource family.
    pub fn new(tenant: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            resource: resource.into(),
            id: None,
            sub_resource: None,
        }
    }

    /// Narrow to a single resource.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Narrow to a sub-resource.
    pub fn with_sub_resource(mut self, sub: impl Into<String>) -> Self {
        self.sub_resource = Some(sub.into());
        self
    }

    /// Deterministic rendering: `{tenant}:{resource}[:{id}[:{sub}]]`.
    pub fn render(&self) -> String {
        let mut key = format!("{}:{}", self.tenant, self.resource);
        if let Some(id) = &self.id {
            key.push(':');
            key.push_str(id);
            if let Some(sub) = &self.sub_resource {
                key.push(':');
                key.push_str(sub);
            }
        }
        key
    }
}

/// TTLs for the two tiers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// In-process tier TTL; clamped to never exceed the shared TTL in use
    pub local_ttl: Duration,
    /// Shared tier TTL, overridable per call
    pub shared_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl: Duration::from_secs(60),
            shared_ttl: Duration::from_secs(300),
        }
    }
}

struct LocalEntry {
    value: Bytes,
    expires_at: Instant,
}

/// Read-through cache over the local and shared tiers.
pub struct TieredCache {
    config: CacheConfig,
    local: DashMap<String, LocalEntry>,
    shared: Option<Arc<dyn SharedStore>>,
    /// Per-key flight locks collapsing concurrent misses into one fetch
    flights: DashMap<String, Arc<Mutex<()>>>,
}

impl TieredCache {
    /// Create a cache, optionally backed by a shared tier.
    pub fn new(shared: Option<Arc<dyn SharedStore>>, config: CacheConfig) -> Self {
        Self {
            config,
            local: DashMap::new(),
            shared,
            flights: DashMap::new(),
        }
    }

    /// Read through the tiers, invoking `fetcher` only on a full miss.
    ///
    /// `ttl` overrides the shared-tier TTL for this entry; the local TTL is
    /// clamped to it. Shared-tier failures are treated as misses.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        ttl: Option<Duration>,
    ) -> Result<Bytes, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Bytes, UpstreamError>>,
    {
        let rendered = key.render();
        let (local_ttl, shared_ttl) = self.ttls(ttl);

        if let Some(value) = self.local_get(&rendered) {
            return Ok(value);
        }
        if let Some(value) = self.shared_get(&rendered).await {
            self.local_insert(&rendered, value.clone(), local_ttl);
            return Ok(value);
        }

        // Full miss: take the per-key flight lock so only one caller fetches
        let flight = self
            .flights
            .entry(rendered.clone())
            .or_default()
            .value()
            .clone();
        let guard = flight.lock().await;

        // The previous holder may have populated the tiers while we waited
        if let Some(value) = self.local_get(&rendered) {
            drop(guard);
            return Ok(value);
        }
        if let Some(value) = self.shared_get(&rendered).await {
            self.local_insert(&rendered, value.clone(), local_ttl);
            drop(guard);
            return Ok(value);
        }

        debug!(key = %rendered, "cache miss, fetching from upstream");
        let result = fetcher().await;
        match result {
            Ok(value) => {
                self.local_insert(&rendered, value.clone(), local_ttl);
                self.shared_set(&rendered, value.clone(), shared_ttl).await;
                drop(guard);
                self.flights.remove(&rendered);
                Ok(value)
            }
            Err(e) => {
                drop(guard);
                self.flights.remove(&rendered);
                Err(e)
            }
        }
    }

    /// Populate both tiers directly.
    pub async fn set(&self, key: &CacheKey, value: Bytes, ttl: Option<Duration>) {
        let rendered = key.render();
        let (local_ttl, shared_ttl) = self.ttls(ttl);
        self.local_insert(&rendered, value.clone(), local_ttl);
        self.shared_set(&rendered, value, shared_ttl).await;
    }

    /// Drop one entry from both tiers.
    pub async fn invalidate(&self, key: &CacheKey) {
        let rendered = key.render();
        self.local.remove(&rendered);
        if let Some(store) = &self.shared {
            if let Err(e) = store.delete(&rendered).await {
                warn!(key = %rendered, error = %e, "shared cache invalidation failed");
            }
        }
    }

    /// Drop every entry belonging to a tenant.
    pub async fn invalidate_for_tenant(&self, tenant: &str) {
        let prefix = format!("{}:", tenant);
        self.local.retain(|key, _| !key.starts_with(&prefix));
        if let Some(store) = &self.shared {
            match store.delete_prefix(&prefix).await {
                Ok(removed) => debug!(tenant, removed, "invalidated tenant cache entries"),
                Err(e) => warn!(tenant, error = %e, "shared cache invalidation failed"),
            }
        }
    }

    /// Drop every entry for one resource family of a tenant.
    pub async fn invalidate_resource(&self, tenant: &str, resource: &str) {
        let exact = format!("{}:{}", tenant, resource);
        let prefix = format!("{}:{}:", tenant, resource);
        self.local
            .retain(|key, _| key != &exact && !key.starts_with(&prefix));
        if let Some(store) = &self.shared {
            if let Err(e) = store.delete(&exact).await {
                warn!(tenant, resource, error = %e, "shared cache invalidation failed");
            } else if let Err(e) = store.delete_prefix(&prefix).await {
                warn!(tenant, resource, error = %e, "shared cache invalidation failed");
            }
        }
    }

    /// Evict expired local entries and idle flight locks; returns the count
    /// of evicted values.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.local.retain(|_, entry| {
            if now >= entry.expires_at {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.flights
            .retain(|_, flight| Arc::strong_count(flight) > 1);
        removed
    }

    /// Number of live local entries.
    pub fn len(&self) -> usize {
        self.local.len()
    }

    /// Whether the local tier is empty.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Resolve (local, shared) TTLs, enforcing local ≤ shared.
    fn ttls(&self, override_ttl: Option<Duration>) -> (Duration, Duration) {
        let shared_ttl = override_ttl.unwrap_or(self.config.shared_ttl);
        (self.config.local_ttl.min(shared_ttl), shared_ttl)
    }

    fn local_get(&self, key: &str) -> Option<Bytes> {
        let expired = match self.local.get(key) {
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.local
                .remove_if(key, |_, entry| Instant::now() >= entry.expires_at);
        }
        None
    }

    fn local_insert(&self, key: &str, value: Bytes, ttl: Duration) {
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn shared_get(&self, key: &str) -> Option<Bytes> {
        let store = self.shared.as_ref()?;
        match store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "shared cache tier unavailable, treating as miss");
                None
            }
        }
    }

    async fn shared_set(&self, key: &str, value: Bytes, ttl: Duration) {
        if let Some(store) = &self.shared {
            if let Err(e) = store.set(key, value, ttl).await {
                warn!(key, error = %e, "shared cache population failed");
            }
        }
    }
}
