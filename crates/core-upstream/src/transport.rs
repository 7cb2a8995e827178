//! Transport seam between the resilience layer and the actual HTTP client
//!
//! The layer never opens a socket itself. Callers inject an
//! [`UpstreamTransport`] that performs the real request; the scheduler and
//! circuit breaker wrap it with pacing, health tracking, and timeouts.
//!
//! Responses carry the provider's rate-limit telemetry: a call-limit header
//! in `{currentCalls}/{maxCalls}` form and an optional `Retry-After` header
//! on throttling responses. Parsing both is this module's job.

use crate::error::UpstreamError;
use bytes::Bytes;
use std::time::Duration;

/// HTTP method of an upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// A fully described outbound call.
///
/// The spec is opaque to the scheduler apart from the `operation` name,
/// which keys the circuit breaker (`{tenant}:{operation}`). Retrying a
/// spec is assumed safe by the caller.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// HTTP method
    pub method: Method,
    /// Provider-relative path, e.g. `/products.json`
    pub path: String,
    /// Opaque request payload, if any
    pub body: Option<Bytes>,
    /// Logical operation name, e.g. `get_products`
    pub operation: String,
}

impl RequestSpec {
    /// Create a request spec.
    pub fn new(method: Method, path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            operation: operation.into(),
        }
    }

    /// Convenience constructor for a GET request.
    pub fn get(path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(Method::Get, path, operation)
    }

    /// Convenience constructor for a POST request.
    pub fn post(path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(Method::Post, path, operation)
    }

    /// Attach a payload.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// A raw upstream response, before the layer classifies it.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers as (name, value) pairs; names matched
    /// case-insensitively by the accessors
    pub headers: Vec<(String, String)>,
    /// Opaque response payload
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Build a response with no headers (test and fallback paths).
    pub fn new(status: u16, body: Bytes) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a header value, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse the provider's call-limit header (`{current}/{max}`).
    ///
    /// Returns `None` if the header is absent or malformed — the scheduler
    /// keeps its current estimate in that case.
    pub fn call_limit(&self, header_name: &str) -> Option<(u32, u32)> {
        let raw = self.header(header_name)?;
        let (current, max) = raw.split_once('/')?;
        let current = current.trim().parse().ok()?;
        let max: u32 = max.trim().parse().ok()?;
        if max == 0 {
            return None;
        }
        Some((current, max))
    }

    /// Parse a `Retry-After` hint in seconds.
    pub fn retry_after(&self, header_name: &str) -> Option<Duration> {
        let secs: u64 = self.header(header_name)?.trim().parse().ok()?;
        Some(Duration::from_secs(secs))
    }
}

/// The injected HTTP seam.
///
/// Implementations perform one request and return whatever the upstream
/// said, including error statuses — classification (429 vs 5xx vs success)
/// belongs to the scheduler. `Err` is reserved for transport-level
/// failures where no response exists (DNS, connect, TLS).
#[async_trait::async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Perform the request against the given tenant's upstream endpoint.
    async fn send(
        &self,
        tenant: &str,
        request: &RequestSpec,
    ) -> Result<UpstreamResponse, UpstreamError>;
}
