//! Request-scoped context: correlation IDs, cancellation, per-component timing.

use std::time::Instant;

use axum::http::HeaderMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Header the correlation ID is echoed back on for client-side log correlation.
pub const CORRELATION_ID_HEADER: &str = "x-request-id";

/// Carries everything downstream components need that isn't part of the
/// request body itself: who to blame in logs, when to give up, and how to
/// tell in-flight work to stop early.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub cancellation: CancellationToken,
    started_at: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Build a context from inbound headers, reusing a caller-supplied
    /// correlation ID when present so multi-hop traces line up.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let correlation_id = headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            correlation_id,
            cancellation: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_caller_supplied_correlation_id() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_ID_HEADER, "abc-123".parse().unwrap());

        let context = RequestContext::from_headers(&headers);
        assert_eq!(context.correlation_id, "abc-123");
    }

    #[test]
    fn generates_correlation_id_when_absent() {
        let context = RequestContext::from_headers(&HeaderMap::new());
        assert_eq!(context.correlation_id.len(), 36);
    }
}
