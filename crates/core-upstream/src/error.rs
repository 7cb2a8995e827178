//! Error types for the upstream resilience layer

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the resilience layer.
///
/// Infrastructure failures with a safe default (quota pressure, an
/// unavailable shared store) are absorbed internally wherever possible;
/// everything the upstream itself said is surfaced to the caller unchanged.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream rejected the call for rate-limit reasons (HTTP 429).
    ///
    /// Retried transparently by the scheduler up to its attempt budget,
    /// then surfaced.
    #[error("upstream quota exceeded, retry after {retry_after:?}")]
    QuotaExceeded {
        /// Delay hinted by the upstream (or the configured default)
        retry_after: Duration,
    },

    /// The circuit for this key is open; no network call was attempted.
    #[error("circuit open, next attempt in {retry_in:?}")]
    CircuitOpen {
        /// Time until the next probe is admitted (zero when the circuit is
        /// half-open and saturated with trial calls)
        retry_in: Duration,
    },

    /// The upstream answered with a non-success status other than 429.
    #[error("upstream error: status {status}")]
    Upstream {
        /// HTTP status returned by the upstream
        status: u16,
        /// Raw response body, passed through verbatim
        body: bytes::Bytes,
    },

    /// The call did not complete within the configured timeout.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// The transport failed before a response was produced.
    #[error("transport error: {0}")]
    Transport(String),

    /// A webhook business handler failed.
    #[error("webhook handler failed: {0}")]
    Handler(String),

    /// The shared store (cache tier / dedup backend) is unavailable.
    ///
    /// Never surfaced from the cache or deduplicator — both degrade to
    /// local-only operation; this variant exists for backend implementors.
    #[error("shared store unavailable: {0}")]
    SharedStore(String),

    /// The scheduler was shut down while the request was queued.
    #[error("scheduler stopped before the request was dispatched")]
    SchedulerStopped,
}

impl UpstreamError {
    /// True for rate-limit rejections, which the scheduler retries itself.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, UpstreamError::QuotaExceeded { .. })
    }

    /// True for errors that should count against a circuit's health.
    ///
    /// Quota pressure and fast-failed calls say nothing about the upstream
    /// endpoint being broken, so they never trip the breaker.
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            UpstreamError::Upstream { .. }
                | UpstreamError::Timeout(_)
                | UpstreamError::Transport(_)
        )
    }
}
