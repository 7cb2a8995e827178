//! Rate-limited request scheduler with per-tenant priority queues
//!
//! Each tenant (one connected upstream store) gets its own connection
//! record tracking the provider's advertised quota: calls used in the
//! current window, the window ceiling, and when the window resets. Requests
//! with spare quota and an empty queue execute immediately; everything else
//! is queued in strict priority order (FIFO within a priority) and drained
//! by a periodic scheduling tick.
//!
//! The scheduler adapts to what the upstream reports back:
//! - call-limit telemetry (`{current}/{max}`) replaces the local estimate
//!   after every response
//! - high utilization imposes a brief self-pause before the provider's
//!   hard limit is ever reached
//! - a 429 throttles the connection for the hinted `Retry-After` and
//!   re-queues the request with its attempt counter incremented, up to a
//!   bounded attempt budget
//!
//! Everything else (non-rate-limit upstream errors, timeouts) passes
//! through to the caller untouched; endpoint health is the circuit
//! breaker's job, applied around the transport call at dispatch time.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::UpstreamError;
use crate::transport::{RequestSpec, UpstreamResponse, UpstreamTransport};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

/// Request priority. Higher dequeues first; ties break FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Bulk operations
    Background,
    /// Analytics, reporting
    Low,
    /// Catalog reads and updates
    Medium,
    /// Inventory and order updates
    High,
    /// Checkout-adjacent flows
    Critical,
}

impl Priority {
    /// Numeric weight, for logs and dashboards.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Critical => 100,
            Priority::High => 75,
            Priority::Medium => 50,
            Priority::Low => 25,
            Priority::Background => 10,
        }
    }
}

/// Configuration for pacing and retry behavior.
///
/// The soften/throttle ratios and the leak rate are heuristics tuned per
/// provider; they are configuration, not contract.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Quota assumed for a tenant before the first telemetry arrives
    pub default_max_calls: u32,
    /// Quota window assumed before the first telemetry arrives
    pub default_window: Duration,
    /// Scheduling tick interval
    pub tick_interval: Duration,
    /// Per-call timeout; a timeout counts as a circuit failure
    pub call_timeout: Duration,
    /// Total attempts per request across rate-limit retries
    pub max_attempts: u32,
    /// Throttle duration applied on a 429 without a Retry-After hint
    pub default_retry_after: Duration,
    /// Calls the provider's bucket drains per second (reset estimation)
    pub leak_rate_per_sec: f64,
    /// Utilization at which a brief self-pause is imposed
    pub soften_ratio: f64,
    /// Utilization at which the connection throttles until reset
    pub throttle_ratio: f64,
    /// Length of the self-imposed pause
    pub soften_pause: Duration,
    /// Header carrying `{current}/{max}` call telemetry
    pub call_limit_header: String,
    /// Header carrying the retry hint on throttling responses
    pub retry_after_header: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_calls: 40,
            default_window: Duration::from_secs(20),
            tick_interval: Duration::from_millis(100),
            call_timeout: Duration::from_secs(10),
            max_attempts: 5,
            default_retry_after: Duration::from_secs(5),
            leak_rate_per_sec: 2.0,
            soften_ratio: 0.80,
            throttle_ratio: 0.95,
            soften_pause: Duration::from_secs(1),
            call_limit_header: "X-Api-Call-Limit".to_string(),
            retry_after_header: "Retry-After".to_string(),
        }
    }
}

/// A queued unit of work, resolved through a oneshot once dispatched.
struct PendingRequest {
    spec: RequestSpec,
    priority: Priority,
    /// Monotonic sequence for the FIFO tie-break (timestamps can collide)
    seq: u64,
    enqueued_at: Instant,
    /// Attempts already made (rate-limit retries carry this forward)
    attempts: u32,
    reply: oneshot::Sender<Result<UpstreamResponse, UpstreamError>>,
}

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingRequest {}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Mutable per-tenant quota and queue state, serialized by one mutex.
struct ConnectionState {
    current_calls: u32,
    max_calls: u32,
    reset_at: Instant,
    throttled: bool,
    softened_until: Option<Instant>,
    queue: BinaryHeap<PendingRequest>,
}

impl ConnectionState {
    /// Roll the quota window once its reset time has passed.
    fn refresh(&mut self, now: Instant, window: Duration) {
        if now >= self.reset_at {
            self.current_calls = 0;
            self.throttled = false;
            self.reset_at = now + window;
        }
    }

    /// Whether a call may be dispatched right now.
    fn eligible(&self, now: Instant) -> bool {
        let softened = match self.softened_until {
            Some(until) => now < until,
            None => false,
        };
        !self.throttled && !softened && self.current_calls < self.max_calls
    }
}

/// One long-lived connection record per tenant.
struct TenantConnection {
    tenant: String,
    state: Mutex<ConnectionState>,
}

/// Read-only view of one tenant connection, for health dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    /// Tenant identifier
    pub tenant: String,
    /// Calls counted against the current window
    pub current_calls: u32,
    /// Window ceiling
    pub max_calls: u32,
    /// Milliseconds until the estimated window reset
    pub reset_in_ms: u64,
    /// Whether the connection is throttled
    pub throttled: bool,
    /// Requests waiting in the priority queue
    pub queue_depth: usize,
}

/// Paces outbound calls per tenant against the upstream's advertised quota.
///
/// Cloning is cheap; all clones share the same connection registry.
#[derive(Clone)]
pub struct RequestScheduler {
    config: Arc<SchedulerConfig>,
    transport: Arc<dyn UpstreamTransport>,
    breakers: CircuitBreakerRegistry,
    connections: Arc<DashMap<String, Arc<TenantConnection>>>,
    seq: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

impl RequestScheduler {
    /// Create a scheduler over the given transport and breaker registry.
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        breakers: CircuitBreakerRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            breakers,
            connections: Arc::new(DashMap::new()),
            seq: Arc::new(AtomicU64::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submit a request for `tenant` at the given priority.
    ///
    /// Resolves once the request has been dispatched and answered, after
    /// transparent rate-limit retries up to the attempt budget. Dropping
    /// the returned future abandons the result but not the in-flight call.
    pub async fn submit(
        &self,
        tenant: &str,
        spec: RequestSpec,
        priority: Priority,
    ) -> Result<UpstreamResponse, UpstreamError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(UpstreamError::SchedulerStopped);
        }

        let conn = self.connection(tenant);
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            spec,
            priority,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            enqueued_at: Instant::now(),
            attempts: 0,
            reply: tx,
        };

        let mut st = conn.state.lock().await;
        let now = Instant::now();
        st.refresh(now, self.config.default_window);
        if st.queue.is_empty() && st.eligible(now) {
            // Fast path: spare quota, nothing waiting — dispatch inline
            st.current_calls += 1;
            drop(st);
            self.run(conn.clone(), request).await;
        } else {
            debug!(
                tenant,
                priority = priority.weight(),
                queue_depth = st.queue.len() + 1,
                "request queued"
            );
            st.queue.push(request);
            drop(st);
        }

        rx.await.map_err(|_| UpstreamError::SchedulerStopped)?
    }

    /// Run the scheduling tick until `shutdown` fires.
    pub async fn run_ticker(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick_once().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Stop accepting work and fail everything still queued.
    pub async fn drain(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let conns: Vec<Arc<TenantConnection>> = self
            .connections
            .iter()
            .map(|r| r.value().clone())
            .collect();
        for conn in conns {
            let mut st = conn.state.lock().await;
            while let Some(request) = st.queue.pop() {
                let _ = request.reply.send(Err(UpstreamError::SchedulerStopped));
            }
        }
    }

    /// Snapshot all tenant connections for the operational surface.
    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let conns: Vec<Arc<TenantConnection>> = self
            .connections
            .iter()
            .map(|r| r.value().clone())
            .collect();
        let now = Instant::now();
        let mut out = Vec::with_capacity(conns.len());
        for conn in conns {
            let st = conn.state.lock().await;
            out.push(ConnectionSnapshot {
                tenant: conn.tenant.clone(),
                current_calls: st.current_calls,
                max_calls: st.max_calls,
                reset_in_ms: st.reset_at.saturating_duration_since(now).as_millis() as u64,
                throttled: st.throttled,
                queue_depth: st.queue.len(),
            });
        }
        out
    }

    /// One pass of the scheduling tick: roll windows, clear expired
    /// throttles, drain eligible queued requests in priority order.
    async fn tick_once(&self) {
        let conns: Vec<Arc<TenantConnection>> = self
            .connections
            .iter()
            .map(|r| r.value().clone())
            .collect();

        for conn in conns {
            let mut st = conn.state.lock().await;
            let now = Instant::now();
            let was_throttled = st.throttled;
            st.refresh(now, self.config.default_window);
            if was_throttled && !st.throttled {
                info!(tenant = %conn.tenant, "connection unthrottled");
            }

            while st.eligible(now) {
                let Some(request) = st.queue.pop() else { break };
                st.current_calls += 1;
                debug!(
                    tenant = %conn.tenant,
                    priority = request.priority.weight(),
                    waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
                    remaining = st.queue.len(),
                    "dispatching queued request"
                );
                let scheduler = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    scheduler.run(conn, request).await;
                });
            }
        }
    }

    /// Dispatch one request, handling the rate-limit retry path.
    ///
    /// A quota slot must already be reserved by the caller (fast path or
    /// tick). Non-rate-limit outcomes resolve the caller's future as-is.
    async fn run(&self, conn: Arc<TenantConnection>, mut request: PendingRequest) {
        request.attempts += 1;
        match self.dispatch(&conn, &request.spec).await {
            Err(UpstreamError::QuotaExceeded { retry_after }) => {
                {
                    let mut st = conn.state.lock().await;
                    st.throttled = true;
                    st.reset_at = Instant::now() + retry_after;
                }
                warn!(
                    tenant = %conn.tenant,
                    retry_after_ms = retry_after.as_millis() as u64,
                    attempts = request.attempts,
                    "rate limited by upstream"
                );
                if request.attempts >= self.config.max_attempts {
                    let _ = request
                        .reply
                        .send(Err(UpstreamError::QuotaExceeded { retry_after }));
                } else {
                    // Bounded retry: back into the queue with its attempt
                    // count; the tick picks it up after the throttle clears
                    let mut st = conn.state.lock().await;
                    st.queue.push(request);
                }
            }
            outcome => {
                // Abandoned callers just drop the receiver
                let _ = request.reply.send(outcome);
            }
        }
    }

    /// The actual upstream call: circuit-gated, timeout-bounded, with
    /// response classification and telemetry absorption.
    async fn dispatch(
        &self,
        conn: &Arc<TenantConnection>,
        spec: &RequestSpec,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let circuit_key = format!("{}:{}", conn.tenant, spec.operation);
        let transport = self.transport.clone();
        let tenant = conn.tenant.clone();
        let request = spec.clone();
        let call_timeout = self.config.call_timeout;
        let retry_header = self.config.retry_after_header.clone();
        let default_retry = self.config.default_retry_after;

        let result = self
            .breakers
            .execute(&circuit_key, move || async move {
                let resp =
                    match tokio::time::timeout(call_timeout, transport.send(&tenant, &request))
                        .await
                    {
                        Ok(result) => result?,
                        Err(_) => return Err(UpstreamError::Timeout(call_timeout)),
                    };
                if resp.status == 429 {
                    let retry_after = resp.retry_after(&retry_header).unwrap_or(default_retry);
                    return Err(UpstreamError::QuotaExceeded { retry_after });
                }
                if !resp.is_success() {
                    return Err(UpstreamError::Upstream {
                        status: resp.status,
                        body: resp.body,
                    });
                }
                Ok(resp)
            })
            .await;

        match result {
            Ok(resp) => {
                self.absorb_telemetry(conn, &resp).await;
                Ok(resp)
            }
            Err(e) => Err(e),
        }
    }

    /// Fold the provider's call-limit telemetry into the connection.
    async fn absorb_telemetry(&self, conn: &Arc<TenantConnection>, resp: &UpstreamResponse) {
        let Some((current, max)) = resp.call_limit(&self.config.call_limit_header) else {
            return;
        };
        let mut st = conn.state.lock().await;
        st.current_calls = current;
        st.max_calls = max;
        // The provider's bucket drains at a roughly constant rate
        let drain_secs = (current as f64 / self.config.leak_rate_per_sec).ceil() as u64;
        st.reset_at = Instant::now() + Duration::from_secs(drain_secs);

        let utilization = current as f64 / max as f64;
        if utilization >= self.config.throttle_ratio {
            st.throttled = true;
            warn!(
                tenant = %conn.tenant,
                current, max, "quota critical, throttled until estimated reset"
            );
        } else if utilization >= self.config.soften_ratio {
            st.softened_until = Some(Instant::now() + self.config.soften_pause);
            debug!(tenant = %conn.tenant, current, max, "quota high, softening");
        }
    }

    fn connection(&self, tenant: &str) -> Arc<TenantConnection> {
        self.connections
            .entry(tenant.to_string())
            .or_insert_with(|| {
                info!(tenant, "initialized upstream connection");
                Arc::new(TenantConnection {
                    tenant: tenant.to_string(),
                    state: Mutex::new(ConnectionState {
                        current_calls: 0,
                        max_calls: self.config.default_max_calls,
                        reset_at: Instant::now() + self.config.default_window,
                        throttled: false,
                        softened_until: None,
                        queue: BinaryHeap::new(),
                    }),
                })
            })
            .value()
            .clone()
    }
}
