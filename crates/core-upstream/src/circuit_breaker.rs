//! Per-key circuit breaker for upstream endpoint health
//!
//! Health is tracked at circuit-key granularity (`{tenant}:{operation}`),
//! so one misbehaving endpoint on one store never blocks the rest of the
//! fleet. Each key runs the classic three-state machine:
//! - Closed: normal operation, calls pass through
//! - Open: calls fail immediately, no network attempt
//! - HalfOpen: a limited number of trial calls probe for recovery
//!
//! While open, the retry delay grows exponentially with every failure past
//! the threshold (bounded exponent), so a chronically dead endpoint is
//! probed less and less often.

use crate::error::UpstreamError;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// State of a single circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls fail immediately until `next_attempt`
    Open {
        /// When the next probe is admitted
        next_attempt: Instant,
    },
    /// Probing for recovery
    HalfOpen,
}

/// Configuration for circuit behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while closed before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close the circuit
    pub half_open_success_threshold: u32,
    /// Base delay before an open circuit admits a probe
    pub reset_timeout: Duration,
    /// Cap on the backoff exponent: delay = reset_timeout * 2^min(excess, cap)
    pub max_backoff_exponent: u32,
    /// Maximum concurrent trial calls while half-open
    pub half_open_max_probes: u32,
    /// Closed circuits with zero failures and no activity for this long
    /// are evicted (a fresh record behaves identically)
    pub idle_eviction_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            max_backoff_exponent: 10,
            half_open_max_probes: 1,
            idle_eviction_after: Duration::from_secs(3600),
        }
    }
}

/// Internal per-key record.
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    /// Consecutive failures; resets to 0 only on transition to Closed
    failure_count: u32,
    half_open_successes: u32,
    in_flight_probes: u32,
    last_failure_at: Option<Instant>,
    last_activity: Instant,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            in_flight_probes: 0,
            last_failure_at: None,
            last_activity: Instant::now(),
        }
    }
}

/// Read-only view of one circuit, for health dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Circuit key
    pub key: String,
    /// `"closed"`, `"open"`, or `"half_open"`
    pub state: &'static str,
    /// Consecutive failure count
    pub failure_count: u32,
    /// Milliseconds until the next probe, while open
    pub retry_in_ms: Option<u64>,
}

/// Keyed circuit breaker registry.
///
/// Records are created lazily per key and evicted after a long idle period
/// with no failures. State transitions for one key are atomic (per-record
/// mutex); different keys never contend.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    config: Arc<CircuitBreakerConfig>,
    records: Arc<DashMap<String, Arc<Mutex<CircuitRecord>>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            records: Arc::new(DashMap::new()),
        }
    }

    /// Create a registry with default configuration.
    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Execute an operation guarded by the circuit for `key`.
    ///
    /// If the circuit is open the operation is not invoked and
    /// [`UpstreamError::CircuitOpen`] is returned. Errors that
    /// [`UpstreamError::should_trip_breaker`] are recorded as failures;
    /// others pass through without touching the circuit's health.
    pub async fn execute<F, Fut, T>(&self, key: &str, op: F) -> Result<T, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let record = self.record(key);

        let admitted_as_probe = {
            let mut rec = record.lock().await;
            rec.last_activity = Instant::now();
            match rec.state {
                CircuitState::Closed => false,
                CircuitState::Open { next_attempt } => {
                    let now = Instant::now();
                    if now >= next_attempt {
                        rec.state = CircuitState::HalfOpen;
                        rec.half_open_successes = 0;
                        rec.in_flight_probes = 1;
                        info!(circuit = key, "circuit half-open, admitting probe");
                        true
                    } else {
                        return Err(UpstreamError::CircuitOpen {
                            retry_in: next_attempt - now,
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    if rec.in_flight_probes >= self.config.half_open_max_probes {
                        return Err(UpstreamError::CircuitOpen {
                            retry_in: Duration::ZERO,
                        });
                    }
                    rec.in_flight_probes += 1;
                    true
                }
            }
        };

        let result = op().await;

        let mut rec = record.lock().await;
        if admitted_as_probe {
            rec.in_flight_probes = rec.in_flight_probes.saturating_sub(1);
        }
        match &result {
            Ok(_) => self.on_success(&mut rec, key),
            Err(e) if e.should_trip_breaker() => self.on_failure(&mut rec, key),
            // Rate-limit rejections and other non-health errors leave the
            // circuit untouched
            Err(_) => {}
        }
        result
    }

    /// Administrative override of a circuit's state.
    ///
    /// Forcing `Closed` resets the failure count, as any transition to
    /// Closed does.
    pub async fn force_state(&self, key: &str, state: CircuitState) {
        let record = self.record(key);
        let mut rec = record.lock().await;
        warn!(circuit = key, ?state, "circuit state forced");
        rec.state = state;
        rec.last_activity = Instant::now();
        match state {
            CircuitState::Closed => {
                rec.failure_count = 0;
                rec.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                rec.half_open_successes = 0;
                rec.in_flight_probes = 0;
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Current state of a circuit, if a record exists.
    pub async fn state_of(&self, key: &str) -> Option<CircuitState> {
        let record = self.records.get(key)?.value().clone();
        let rec = record.lock().await;
        Some(rec.state)
    }

    /// Evict idle healthy circuits to bound memory.
    ///
    /// Only Closed records with zero failures past the idle window are
    /// removed; a fresh record behaves identically, so eviction is
    /// externally unobservable.
    pub fn evict_idle(&self) {
        let idle_after = self.config.idle_eviction_after;
        self.records.retain(|_, record| match record.try_lock() {
            Ok(rec) => {
                !(matches!(rec.state, CircuitState::Closed)
                    && rec.failure_count == 0
                    && rec.last_activity.elapsed() >= idle_after)
            }
            // Locked means in use
            Err(_) => true,
        });
    }

    /// Number of tracked circuits.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether any circuits are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot all circuits for the operational surface.
    pub async fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let entries: Vec<(String, Arc<Mutex<CircuitRecord>>)> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let now = Instant::now();
        let mut out = Vec::with_capacity(entries.len());
        for (key, record) in entries {
            let rec = record.lock().await;
            let (state, retry_in_ms) = match rec.state {
                CircuitState::Closed => ("closed", None),
                CircuitState::HalfOpen => ("half_open", None),
                CircuitState::Open { next_attempt } => (
                    "open",
                    Some(next_attempt.saturating_duration_since(now).as_millis() as u64),
                ),
            };
            out.push(CircuitSnapshot {
                key,
                state,
                failure_count: rec.failure_count,
                retry_in_ms,
            });
        }
        out
    }

    fn record(&self, key: &str) -> Arc<Mutex<CircuitRecord>> {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::new())))
            .value()
            .clone()
    }

    fn on_success(&self, rec: &mut CircuitRecord, key: &str) {
        match rec.state {
            CircuitState::Closed => {
                rec.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                rec.half_open_successes += 1;
                if rec.half_open_successes >= self.config.half_open_success_threshold {
                    rec.state = CircuitState::Closed;
                    rec.failure_count = 0;
                    rec.half_open_successes = 0;
                    info!(circuit = key, "circuit closed after successful probes");
                }
            }
            // A forced-open circuit stays open until the override is lifted
            CircuitState::Open { .. } => {}
        }
    }

    fn on_failure(&self, rec: &mut CircuitRecord, key: &str) {
        rec.last_failure_at = Some(Instant::now());
        match rec.state {
            CircuitState::Closed => {
                rec.failure_count += 1;
                if rec.failure_count >= self.config.failure_threshold {
                    let delay = self.backoff(rec.failure_count);
                    rec.state = CircuitState::Open {
                        next_attempt: Instant::now() + delay,
                    };
                    warn!(
                        circuit = key,
                        failures = rec.failure_count,
                        ?delay,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // A single probe failure reopens immediately
                rec.failure_count += 1;
                rec.half_open_successes = 0;
                let delay = self.backoff(rec.failure_count);
                rec.state = CircuitState::Open {
                    next_attempt: Instant::now() + delay,
                };
                warn!(
                    circuit = key,
                    failures = rec.failure_count,
                    ?delay,
                    "probe failed, circuit reopened"
                );
            }
            CircuitState::Open { .. } => {
                debug!(circuit = key, "failure recorded while already open");
            }
        }
    }

    /// Backoff keyed to how far the failure count exceeds the threshold.
    fn backoff(&self, failure_count: u32) -> Duration {
        let excess = failure_count
            .saturating_sub(self.config.failure_threshold)
            .min(self.config.max_backoff_exponent);
        self.config.reset_timeout.saturating_mul(1u32 << excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            half_open_success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn transport_err() -> UpstreamError {
        UpstreamError::Transport("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_closed_to_open_after_threshold() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..3 {
            let result: Result<(), _> = registry
                .execute("shop-1:get_products", || async { Err(transport_err()) })
                .await;
            assert!(result.is_err());
        }

        match registry.state_of("shop-1:get_products").await {
            Some(CircuitState::Open { .. }) => {}
            state => panic!("expected Open, got {:?}", state),
        }
    }

    #[tokio::test]
    async fn test_open_fails_fast_without_invoking_op() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let _: Result<(), _> = registry
                .execute("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transport_err())
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Circuit is open: the operation must not run
        let calls2 = calls.clone();
        let result: Result<(), _> = registry
            .execute("k", move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(UpstreamError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_half_open_to_closed() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..3 {
            let _: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First success transitions Open -> HalfOpen and counts
        for _ in 0..2 {
            let result = registry.execute("k", || async { Ok(()) }).await;
            assert!(result.is_ok());
        }

        assert_eq!(registry.state_of("k").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..3 {
            let _: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Probe fails: straight back to Open, no pass through Closed
        let result: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        assert!(result.is_err());
        match registry.state_of("k").await {
            Some(CircuitState::Open { .. }) => {}
            state => panic!("expected Open, got {:?}", state),
        }
    }

    #[tokio::test]
    async fn test_backoff_grows_with_excess_failures() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        // threshold 3 -> excess 0 -> 50ms; each further failure doubles
        assert_eq!(registry.backoff(3), Duration::from_millis(50));
        assert_eq!(registry.backoff(4), Duration::from_millis(100));
        assert_eq!(registry.backoff(5), Duration::from_millis(200));
        // Bounded exponent
        assert_eq!(
            registry.backoff(100),
            Duration::from_millis(50) * (1u32 << 10)
        );
    }

    #[tokio::test]
    async fn test_quota_errors_do_not_trip() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..10 {
            let _: Result<(), _> = registry
                .execute("k", || async {
                    Err(UpstreamError::QuotaExceeded {
                        retry_after: Duration::from_secs(1),
                    })
                })
                .await;
        }
        assert_eq!(registry.state_of("k").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_while_closed() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..2 {
            let _: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        }
        let _ = registry.execute("k", || async { Ok(()) }).await;
        // Two more failures are below the threshold again
        for _ in 0..2 {
            let _: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        }
        assert_eq!(registry.state_of("k").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_half_open_probe_cap() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            half_open_max_probes: 1,
            reset_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let registry = CircuitBreakerRegistry::new(config);

        let _: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // First probe holds the slot; a concurrent second call is rejected
        let registry2 = registry.clone();
        let slow_probe = tokio::spawn(async move {
            registry2
                .execute("k", || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result: Result<(), _> = registry.execute("k", || async { Ok(()) }).await;
        assert!(matches!(result, Err(UpstreamError::CircuitOpen { .. })));

        assert!(slow_probe.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_force_state() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..3 {
            let _: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        }
        registry.force_state("k", CircuitState::Closed).await;
        assert_eq!(registry.state_of("k").await, Some(CircuitState::Closed));

        let result = registry.execute("k", || async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let registry = CircuitBreakerRegistry::new(fast_config());

        for _ in 0..3 {
            let _: Result<(), _> = registry
                .execute("shop-1:op", || async { Err(transport_err()) })
                .await;
        }

        // shop-2 is unaffected
        let result = registry.execute("shop-2:op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_idle_eviction_only_removes_healthy_records() {
        let config = CircuitBreakerConfig {
            idle_eviction_after: Duration::from_millis(10),
            ..fast_config()
        };
        let registry = CircuitBreakerRegistry::new(config);

        let _ = registry.execute("healthy", || async { Ok(()) }).await;
        for _ in 0..3 {
            let _: Result<(), _> = registry
                .execute("broken", || async { Err(transport_err()) })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.evict_idle();

        assert_eq!(registry.state_of("healthy").await, None);
        assert!(matches!(
            registry.state_of("broken").await,
            Some(CircuitState::Open { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..3 {
            let _: Result<(), _> = registry.execute("k", || async { Err(transport_err()) }).await;
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, "open");
        assert_eq!(snapshot[0].failure_count, 3);
        assert!(snapshot[0].retry_in_ms.is_some());
    }
}
