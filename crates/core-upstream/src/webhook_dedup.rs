//! Idempotency guard for inbound webhook processing
//!
//! The upstream delivers webhooks at-least-once; this module guarantees the
//! business processor runs at most once per provider-issued webhook id
//! within the deduplication window.
//!
//! Two tiers back the guard: a local concurrent map (always present) and an
//! optional shared store that is authoritative across processes. Claiming
//! an id is atomic at both tiers — the local map's entry API picks exactly
//! one winner among near-simultaneous local callers, and `set_nx` on the
//! shared store settles the race across processes. If the shared store is
//! unavailable the guard degrades to local-only suppression, which bounds
//! duplicate protection to this process's uptime — an accepted weakening
//! under infrastructure failure, logged when it happens.
//!
//! The guard records outcomes, not business intent: a processor that failed
//! is still recorded and will not run again for the same id within the
//! window. Business-level retry policy lives with the caller.

use crate::error::UpstreamError;
use crate::shared_store::SharedStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Configuration for the deduplication window.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a processed id suppresses redelivery
    pub ttl: Duration,
    /// Local in-flight claims older than this are considered stuck and
    /// reaped by the sweep (the processor never returned)
    pub stale_claim_after: Duration,
    /// Namespace prefix for shared-store keys
    pub key_prefix: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            stale_claim_after: Duration::from_secs(600),
            key_prefix: "wh:".to_string(),
        }
    }
}

/// Outcome metadata persisted per processed webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedWebhookRecord {
    /// Whether the processor returned success
    pub success: bool,
    /// Completion time, milliseconds since the Unix epoch
    pub completed_at_epoch_ms: u64,
    /// Arbitrary key-values (error text, handler name, ...)
    pub metadata: HashMap<String, String>,
}

/// Local per-id entry: a claim in progress, or a finished record.
enum DedupEntry {
    InFlight { started: Instant },
    Done { at: Instant },
}

/// Result of [`WebhookDeduplicator::process_once`].
#[derive(Debug)]
pub enum DedupOutcome<T> {
    /// The processor ran and returned this value
    Processed(T),
    /// A non-expired record exists; the processor was not invoked.
    /// This is a normal outcome, not an error.
    Duplicate,
}

impl<T> DedupOutcome<T> {
    /// Whether this delivery was suppressed as a duplicate.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupOutcome::Duplicate)
    }
}

/// At-most-once processing guard keyed by webhook id.
pub struct WebhookDeduplicator {
    config: DedupConfig,
    local: DashMap<String, DedupEntry>,
    shared: Option<Arc<dyn SharedStore>>,
}

impl WebhookDeduplicator {
    /// Create a deduplicator, optionally backed by a shared store.
    pub fn new(shared: Option<Arc<dyn SharedStore>>, config: DedupConfig) -> Self {
        Self {
            config,
            local: DashMap::new(),
            shared,
        }
    }

    /// Run `processor` unless `webhook_id` was already processed within the
    /// deduplication window.
    ///
    /// Exactly one of any set of concurrent callers with the same id runs
    /// the processor; the rest see [`DedupOutcome::Duplicate`] immediately,
    /// without waiting for the winner to finish. A processor error is
    /// surfaced to the winner and recorded like any other outcome.
    pub async fn process_once<F, Fut, T>(
        &self,
        webhook_id: &str,
        processor: F,
    ) -> Result<DedupOutcome<T>, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let now = Instant::now();

        // Local fast check
        if let Some(entry) = self.local.get(webhook_id) {
            if !self.entry_expired(entry.value(), now) {
                debug!(webhook_id, "duplicate webhook suppressed locally");
                return Ok(DedupOutcome::Duplicate);
            }
        }

        // The shared store is authoritative when reachable
        let shared_key = format!("{}{}", self.config.key_prefix, webhook_id);
        if let Some(store) = &self.shared {
            match store.get(&shared_key).await {
                Ok(Some(_)) => {
                    debug!(webhook_id, "duplicate webhook suppressed by shared store");
                    return Ok(DedupOutcome::Duplicate);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    webhook_id,
                    error = %e,
                    "shared dedup store unavailable, degrading to local suppression"
                ),
            }
        }

        // Claim locally: the entry API picks one winner
        match self.local.entry(webhook_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.entry_expired(occupied.get(), now) {
                    occupied.insert(DedupEntry::InFlight { started: now });
                } else {
                    debug!(webhook_id, "duplicate webhook lost the local claim");
                    return Ok(DedupOutcome::Duplicate);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DedupEntry::InFlight { started: now });
            }
        }

        // Claim in the shared store: settles the cross-process race
        if let Some(store) = &self.shared {
            let claim = bytes::Bytes::from_static(b"{\"state\":\"in_flight\"}");
            match store.set_nx(&shared_key, claim, self.config.ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    // Another process owns this id; back out our local claim
                    self.local.remove(webhook_id);
                    debug!(webhook_id, "duplicate webhook lost the shared claim");
                    return Ok(DedupOutcome::Duplicate);
                }
                Err(e) => warn!(
                    webhook_id,
                    error = %e,
                    "shared dedup claim failed, proceeding on local claim only"
                ),
            }
        }

        let result = processor().await;

        let record = match &result {
            Ok(_) => ProcessedWebhookRecord {
                success: true,
                completed_at_epoch_ms: epoch_ms(),
                metadata: HashMap::new(),
            },
            Err(e) => {
                let mut metadata = HashMap::new();
                metadata.insert("error".to_string(), e.to_string());
                ProcessedWebhookRecord {
                    success: false,
                    completed_at_epoch_ms: epoch_ms(),
                    metadata,
                }
            }
        };
        self.record_outcome(webhook_id, &shared_key, &record).await;

        result.map(DedupOutcome::Processed)
    }

    /// Evict expired local records and stuck claims; returns the count.
    ///
    /// Matters mostly in degraded (local-only) mode, where the local map is
    /// the only thing bounding memory.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.local.retain(|_, entry| {
            if self.entry_expired(entry, now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(removed, "swept expired webhook records");
        }
        removed
    }

    /// Number of locally tracked ids.
    pub fn len(&self) -> usize {
        self.local.len()
    }

    /// Whether no ids are tracked locally.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    fn entry_expired(&self, entry: &DedupEntry, now: Instant) -> bool {
        match entry {
            DedupEntry::InFlight { started } => {
                now.duration_since(*started) >= self.config.stale_claim_after
            }
            DedupEntry::Done { at } => now.duration_since(*at) >= self.config.ttl,
        }
    }

    async fn record_outcome(
        &self,
        webhook_id: &str,
        shared_key: &str,
        record: &ProcessedWebhookRecord,
    ) {
        self.local.insert(
            webhook_id.to_string(),
            DedupEntry::Done { at: Instant::now() },
        );
        if let Some(store) = &self.shared {
            match serde_json::to_vec(record) {
                Ok(payload) => {
                    if let Err(e) = store
                        .set(shared_key, bytes::Bytes::from(payload), self.config.ttl)
                        .await
                    {
                        warn!(webhook_id, error = %e, "failed to record webhook outcome in shared store");
                    }
                }
                Err(e) => {
                    warn!(webhook_id, error = %e, "failed to serialize webhook outcome");
                }
            }
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
