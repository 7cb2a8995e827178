//! Composition point for the resilience layer
//!
//! The facade owns every registry (connections, circuits, dedup records,
//! cache tiers) and the background tasks that maintain them. Nothing in
//! here is a process-wide singleton: construct two facades and they are
//! fully independent, which is what makes the layer testable.
//!
//! Outbound: `call` checks the cache (for cacheable reads), submits to the
//! scheduler on a miss, and the scheduler's dispatch wraps the transport in
//! the circuit breaker keyed `{tenant}:{operation}`. Successful mutations
//! invalidate the resource family they touched.
//!
//! Inbound: `on_webhook` routes through the deduplicator, then invalidates
//! the cache for the resource named by the webhook topic.

use crate::cache::{CacheConfig, CacheKey, TieredCache};
use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
use crate::error::UpstreamError;
use crate::scheduler::{ConnectionSnapshot, Priority, RequestScheduler, SchedulerConfig};
use crate::shared_store::SharedStore;
use crate::transport::{RequestSpec, UpstreamTransport};
use crate::webhook_dedup::{DedupConfig, DedupOutcome, WebhookDeduplicator};
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cache behavior for a cacheable read.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Structured key the payload is stored under
    pub key: CacheKey,
    /// Shared-tier TTL override for this entry
    pub ttl: Option<Duration>,
}

/// One logical upstream operation, as business logic describes it.
#[derive(Debug, Clone)]
pub struct Operation {
    /// The outbound request
    pub request: RequestSpec,
    /// Present for cacheable reads
    pub cache: Option<CachePolicy>,
    /// Resource family to invalidate after a successful mutation
    pub invalidates: Option<String>,
}

impl Operation {
    /// An uncached operation.
    pub fn new(request: RequestSpec) -> Self {
        Self {
            request,
            cache: None,
            invalidates: None,
        }
    }

    /// Cache the response under `key`.
    pub fn cached(mut self, key: CacheKey, ttl: Option<Duration>) -> Self {
        self.cache = Some(CachePolicy { key, ttl });
        self
    }

    /// Invalidate a resource family once the call succeeds.
    pub fn invalidates(mut self, resource: impl Into<String>) -> Self {
        self.invalidates = Some(resource.into());
        self
    }
}

/// Configuration for the whole layer.
#[derive(Debug, Clone, Default)]
pub struct FacadeConfig {
    pub scheduler: SchedulerConfig,
    pub circuit: CircuitBreakerConfig,
    pub dedup: DedupConfig,
    pub cache: CacheConfig,
    /// Interval of the maintenance sweep (dedup TTLs, idle circuits,
    /// expired cache entries)
    pub sweep_interval: Duration,
}

/// Enumerable view of the layer for dashboards and CLIs.
#[derive(Debug, Clone, Serialize)]
pub struct FacadeSnapshot {
    /// Per-tenant quota and queue state
    pub connections: Vec<ConnectionSnapshot>,
    /// Per-key circuit health
    pub circuits: Vec<CircuitSnapshot>,
}

/// The resilience layer, assembled.
pub struct UpstreamFacade {
    scheduler: RequestScheduler,
    breakers: CircuitBreakerRegistry,
    dedup: Arc<WebhookDeduplicator>,
    cache: Arc<TieredCache>,
    sweep_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpstreamFacade {
    /// Assemble the layer over a transport and an optional shared store.
    ///
    /// The shared store backs both the cache's networked tier and the
    /// webhook deduplicator; passing `None` runs everything in-process.
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        shared: Option<Arc<dyn SharedStore>>,
        config: FacadeConfig,
    ) -> Self {
        let sweep_interval = if config.sweep_interval.is_zero() {
            Duration::from_secs(60)
        } else {
            config.sweep_interval
        };
        let breakers = CircuitBreakerRegistry::new(config.circuit);
        let scheduler = RequestScheduler::new(transport, breakers.clone(), config.scheduler);
        let dedup = Arc::new(WebhookDeduplicator::new(shared.clone(), config.dedup));
        let cache = Arc::new(TieredCache::new(shared, config.cache));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            scheduler,
            breakers,
            dedup,
            cache,
            sweep_interval,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the scheduling tick and the maintenance sweep.
    ///
    /// Idempotent; both tasks stop on [`shutdown`](Self::shutdown).
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            scheduler.run_ticker(shutdown).await;
        }));

        let breakers = self.breakers.clone();
        let dedup = self.dedup.clone();
        let cache = self.cache.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let sweep_interval = self.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        breakers.evict_idle();
                        dedup.sweep_expired();
                        cache.sweep_expired();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        info!("upstream resilience layer started");
    }

    /// Stop the background tasks and fail everything still queued.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.scheduler.drain().await;
        let mut tasks = self.tasks.lock().await;
        join_all(tasks.drain(..)).await;
        info!("upstream resilience layer stopped");
    }

    /// Execute an operation for a tenant at the given priority.
    ///
    /// Cacheable reads consult the tiered cache first; on a miss the fetch
    /// goes through the scheduler like any other call. Returns the response
    /// body; upstream errors surface verbatim.
    pub async fn call(
        &self,
        tenant: &str,
        operation: Operation,
        priority: Priority,
    ) -> Result<Bytes, UpstreamError> {
        if let Some(policy) = &operation.cache {
            let scheduler = self.scheduler.clone();
            let tenant_owned = tenant.to_string();
            let request = operation.request.clone();
            return self
                .cache
                .get_or_fetch(
                    &policy.key,
                    move || async move {
                        let resp = scheduler.submit(&tenant_owned, request, priority).await?;
                        Ok(resp.body)
                    },
                    policy.ttl,
                )
                .await;
        }

        let resp = self
            .scheduler
            .submit(tenant, operation.request, priority)
            .await?;
        if let Some(resource) = &operation.invalidates {
            self.cache.invalidate_resource(tenant, resource).await;
            debug!(tenant, resource, "invalidated cache after mutation");
        }
        Ok(resp.body)
    }

    /// Route an inbound webhook through the deduplicator.
    ///
    /// The handler runs at most once per webhook id within the dedup
    /// window; a successful run invalidates the cache for the resource
    /// named by the topic (`products/update` → `products`).
    pub async fn on_webhook<F, Fut, T>(
        &self,
        tenant: &str,
        webhook_id: &str,
        topic: &str,
        handler: F,
    ) -> Result<DedupOutcome<T>, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let outcome = self.dedup.process_once(webhook_id, handler).await?;
        if let DedupOutcome::Processed(_) = &outcome {
            let resource = topic.split('/').next().unwrap_or(topic);
            self.cache.invalidate_resource(tenant, resource).await;
            debug!(tenant, webhook_id, topic, "processed webhook and invalidated cache");
        }
        Ok(outcome)
    }

    /// Drop one cache entry.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    /// Drop every cache entry belonging to a tenant.
    pub async fn invalidate_for_tenant(&self, tenant: &str) {
        self.cache.invalidate_for_tenant(tenant).await;
    }

    /// Drop every cache entry for one resource family of a tenant.
    pub async fn invalidate_resource(&self, tenant: &str, resource: &str) {
        self.cache.invalidate_resource(tenant, resource).await;
    }

    /// Administrative circuit override.
    pub async fn force_circuit(&self, key: &str, state: CircuitState) {
        self.breakers.force_state(key, state).await;
    }

    /// Current state of one circuit, if tracked.
    pub async fn circuit_state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.state_of(key).await
    }

    /// Enumerable snapshot of connections and circuits.
    pub async fn snapshot(&self) -> FacadeSnapshot {
        FacadeSnapshot {
            connections: self.scheduler.snapshot().await,
            circuits: self.breakers.snapshot().await,
        }
    }
}

impl Drop for UpstreamFacade {
    fn drop(&mut self) {
        // Background tasks exit on their next select if shutdown was never
        // called explicitly
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_store::InMemorySharedStore;
    use crate::transport::UpstreamResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Transport that counts calls and replies per-operation.
    struct CountingTransport {
        calls: Arc<AtomicU32>,
        fail_ops: Vec<&'static str>,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl CountingTransport {
        fn ok() -> (Arc<AtomicU32>, Arc<Self>) {
            let calls = Arc::new(AtomicU32::new(0));
            let transport = Arc::new(Self {
                calls: calls.clone(),
                fail_ops: Vec::new(),
                log: Arc::new(StdMutex::new(Vec::new())),
            });
            (calls, transport)
        }
    }

    #[async_trait::async_trait]
    impl crate::transport::UpstreamTransport for CountingTransport {
        async fn send(
            &self,
            _tenant: &str,
            request: &RequestSpec,
        ) -> Result<UpstreamResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(request.operation.clone());
            if self.fail_ops.iter().any(|op| *op == request.operation) {
                return Ok(UpstreamResponse::new(503, Bytes::from_static(b"down")));
            }
            Ok(UpstreamResponse::new(200, Bytes::from_static(b"payload")))
        }
    }

    fn facade_with(transport: Arc<CountingTransport>) -> UpstreamFacade {
        UpstreamFacade::new(transport, None, FacadeConfig::default())
    }

    fn read_products() -> Operation {
        Operation::new(RequestSpec::get("/products.json", "get_products"))
            .cached(CacheKey::new("shop-1", "products"), None)
    }

    #[tokio::test]
    async fn test_cacheable_read_hits_upstream_once() {
        let (calls, transport) = CountingTransport::ok();
        let facade = facade_with(transport);

        for _ in 0..3 {
            let body = facade
                .call("shop-1", read_products(), Priority::Medium)
                .await
                .unwrap();
            assert_eq!(&body[..], b"payload");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cached_resource() {
        let (calls, transport) = CountingTransport::ok();
        let facade = facade_with(transport);

        // Warm the cache
        facade
            .call("shop-1", read_products(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Mutation declares the resource family it touches
        let mutation = Operation::new(
            RequestSpec::post("/products.json", "create_product")
                .with_body(Bytes::from_static(b"{}")),
        )
        .invalidates("products");
        facade
            .call("shop-1", mutation, Priority::High)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The read refetches
        facade
            .call("shop-1", read_products(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_upstream_failures_open_the_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let transport = Arc::new(CountingTransport {
            calls: calls.clone(),
            fail_ops: vec!["get_orders"],
            log: Arc::new(StdMutex::new(Vec::new())),
        });
        let config = FacadeConfig {
            circuit: CircuitBreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let facade = UpstreamFacade::new(transport, None, config);

        let op = || Operation::new(RequestSpec::get("/orders.json", "get_orders"));
        for _ in 0..3 {
            let result = facade.call("shop-1", op(), Priority::High).await;
            assert!(matches!(result, Err(UpstreamError::Upstream { status: 503, .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Fourth call fails fast, no network attempt
        let result = facade.call("shop-1", op(), Priority::High).await;
        assert!(matches!(result, Err(UpstreamError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Health is keyed per tenant+operation: shop-2 is unaffected
        let result = facade.call("shop-2", op(), Priority::High).await;
        assert!(matches!(result, Err(UpstreamError::Upstream { .. })));
    }

    #[tokio::test]
    async fn test_webhook_runs_once_and_invalidates_topic_resource() {
        let (calls, transport) = CountingTransport::ok();
        let facade = facade_with(transport);
        let handled = Arc::new(AtomicU32::new(0));

        // Warm the products cache
        facade
            .call("shop-1", read_products(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            let handled = handled.clone();
            facade
                .on_webhook("shop-1", "wh-1", "products/update", move || async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        // The webhook invalidated the cached products read
        facade
            .call("shop-1", read_products(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_enumerates_connections_and_circuits() {
        let (_, transport) = CountingTransport::ok();
        let facade = facade_with(transport);

        facade
            .call(
                "shop-1",
                Operation::new(RequestSpec::get("/products.json", "get_products")),
                Priority::Medium,
            )
            .await
            .unwrap();

        let snapshot = facade.snapshot().await;
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.connections[0].tenant, "shop-1");
        assert_eq!(snapshot.circuits.len(), 1);
        assert_eq!(snapshot.circuits[0].key, "shop-1:get_products");
        assert_eq!(snapshot.circuits[0].state, "closed");

        // Serializable for the operational surface
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("shop-1:get_products"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks_and_refuses_work() {
        let (_, transport) = CountingTransport::ok();
        let facade = facade_with(transport);

        facade.start().await;
        // start is idempotent
        facade.start().await;
        facade.shutdown().await;

        let result = facade
            .call(
                "shop-1",
                Operation::new(RequestSpec::get("/products.json", "get_products")),
                Priority::Medium,
            )
            .await;
        assert!(matches!(result, Err(UpstreamError::SchedulerStopped)));
    }

    #[tokio::test]
    async fn test_force_circuit_override() {
        let (calls, transport) = CountingTransport::ok();
        let facade = facade_with(transport);

        facade
            .force_circuit(
                "shop-1:get_products",
                CircuitState::Open {
                    next_attempt: std::time::Instant::now() + Duration::from_secs(60),
                },
            )
            .await;

        let result = facade
            .call(
                "shop-1",
                Operation::new(RequestSpec::get("/products.json", "get_products")),
                Priority::Medium,
            )
            .await;
        assert!(matches!(result, Err(UpstreamError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        facade
            .force_circuit("shop-1:get_products", CircuitState::Closed)
            .await;
        let result = facade
            .call(
                "shop-1",
                Operation::new(RequestSpec::get("/products.json", "get_products")),
                Priority::Medium,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shared_store_wires_cache_and_dedup() {
        let store: Arc<InMemorySharedStore> = Arc::new(InMemorySharedStore::new());
        let (calls_a, transport_a) = CountingTransport::ok();
        let (calls_b, transport_b) = CountingTransport::ok();
        let a = UpstreamFacade::new(transport_a, Some(store.clone()), FacadeConfig::default());
        let b = UpstreamFacade::new(transport_b, Some(store), FacadeConfig::default());

        // A populates the shared cache tier; B reads without an upstream call
        a.call("shop-1", read_products(), Priority::Medium)
            .await
            .unwrap();
        b.call("shop-1", read_products(), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 0);

        // A processes a webhook; B sees the duplicate through the store
        let outcome = a
            .on_webhook("shop-1", "wh-9", "orders/create", || async { Ok(()) })
            .await
            .unwrap();
        assert!(!outcome.is_duplicate());
        let outcome = b
            .on_webhook("shop-1", "wh-9", "orders/create", || async { Ok(()) })
            .await
            .unwrap();
        assert!(outcome.is_duplicate());
    }
}
