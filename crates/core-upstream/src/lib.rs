//! Souk Core Upstream: resilience primitives for third-party API integration
//!
//! # Overview
//!
//! This crate mediates every outbound call from the Souk platform to an
//! external e-commerce provider's API, and every inbound webhook coming
//! back. It provides:
//!
//! - **Request Scheduler**: per-tenant quota pacing with priority queues,
//!   adaptive to the provider's advertised rate limits
//! - **Circuit Breaker**: per-endpoint health tracking that fails fast when
//!   an upstream is unhealthy and probes for recovery
//! - **Webhook Deduplicator**: at-most-once processing of at-least-once
//!   webhook delivery
//! - **Tiered Cache**: in-process plus shared read-through caching with
//!   prefix invalidation
//! - **Resilience Facade**: the composition consumed by sync and webhook
//!   business logic
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - The HTTP client performing requests (injected as [`UpstreamTransport`])
//! - The shared store behind the cache and deduplicator (injected as
//!   [`SharedStore`])
//! - Business entities — payloads are opaque bytes, callers pass identifiers
//!
//! Every registry is owned by the facade you construct; there are no
//! process-wide singletons, and the background tick and sweeps are
//! explicit, cancellable tasks.
//!
//! # Architecture
//!
//! ```text
//!  business logic (product sync, order sync, webhook handlers)
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resilience Facade                 │
//! └──────┬───────────────────────┬──────────┘
//!        │ outbound              │ inbound
//!        ▼                       ▼
//! ┌──────────────────┐   ┌──────────────────┐
//! │  Tiered Cache    │   │  Webhook Dedup   │  ← at-most-once guard
//! │  (local+shared)  │   │  (local+shared)  │
//! └──────┬───────────┘   └──────────────────┘
//!        │ miss
//!        ▼
//! ┌─────────────────────────────────────────┐
//! │  Request Scheduler                      │  ← quota pacing, priorities
//! │  (per-tenant queue + scheduling tick)   │
//! └──────┬──────────────────────────────────┘
//!        ▼
//! ┌─────────────────────────────────────────┐
//! │  Circuit Breaker                        │  ← fail-fast per endpoint
//! │  (keyed {tenant}:{operation})           │
//! └──────┬──────────────────────────────────┘
//!        ▼
//!   UpstreamTransport → provider API
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use souk_core_upstream::prelude::*;
//! use std::sync::Arc;
//!
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl UpstreamTransport for MyTransport {
//! #     async fn send(
//! #         &self,
//! #         _tenant: &str,
//! #         _request: &RequestSpec,
//! #     ) -> Result<UpstreamResponse, UpstreamError> {
//! #         Ok(UpstreamResponse::new(200, bytes::Bytes::new()))
//! #     }
//! # }
//! # async fn example() -> Result<(), UpstreamError> {
//! let facade = UpstreamFacade::new(Arc::new(MyTransport), None, FacadeConfig::default());
//! facade.start().await;
//!
//! let products = facade
//!     .call(
//!         "shop-1.example.com",
//!         Operation::new(RequestSpec::get("/products.json", "get_products"))
//!             .cached(CacheKey::new("shop-1.example.com", "products"), None),
//!         Priority::Medium,
//!     )
//!     .await?;
//!
//! facade.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod error;
pub mod facade;
pub mod scheduler;
pub mod shared_store;
pub mod transport;
pub mod webhook_dedup;

// Re-export main types for convenience
pub use cache::{CacheConfig, CacheKey, TieredCache};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use error::UpstreamError;
pub use facade::{CachePolicy, FacadeConfig, FacadeSnapshot, Operation, UpstreamFacade};
pub use scheduler::{ConnectionSnapshot, Priority, RequestScheduler, SchedulerConfig};
pub use shared_store::{InMemorySharedStore, SharedStore};
pub use transport::{Method, RequestSpec, UpstreamResponse, UpstreamTransport};
pub use webhook_dedup::{DedupConfig, DedupOutcome, WebhookDeduplicator};

#[cfg(feature = "backend-redis")]
pub use shared_store::redis_store::RedisSharedStore;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use souk_core_upstream::prelude::*;
/// ```
pub mod prelude {
    pub use super::cache::{CacheConfig, CacheKey, TieredCache};
    pub use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
    pub use super::error::UpstreamError;
    pub use super::facade::{FacadeConfig, Operation, UpstreamFacade};
    pub use super::scheduler::{Priority, RequestScheduler, SchedulerConfig};
    pub use super::shared_store::{InMemorySharedStore, SharedStore};
    pub use super::transport::{Method, RequestSpec, UpstreamResponse, UpstreamTransport};
    pub use super::webhook_dedup::{DedupConfig, DedupOutcome, WebhookDeduplicator};
}
