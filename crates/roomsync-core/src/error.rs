use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{listeners::ListenerId, types::SyncLifecycleState};

/// Broad error category used for retry decisions and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Server response was structurally invalid and was rejected whole.
    Malformed,
    /// Transport-level failure (connect, timeout, truncated body).
    Network,
    /// Homeserver reported a 5xx-class failure.
    Server,
    /// Rate-limited by homeserver after in-transport retries were exhausted.
    RateLimited,
    /// Authentication/authorization failure.
    Auth,
    /// Invalid input, unsupported request, or other permanent 4xx failure.
    Config,
    /// A listener callback reported a failure during dispatch.
    Listener,
    /// Internal bug, invariant break, or invalid lifecycle transition.
    Internal,
}

/// Stable sync error payload surfaced to error handlers and `stop()` callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new sync error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Build a `MalformedResponse` error for a rejected batch.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Malformed, "malformed_response", reason)
    }

    /// Build a `ListenerFault` error for a failing callback.
    pub fn listener_fault(listener: ListenerId, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            SyncErrorCategory::Listener,
            "listener_fault",
            format!("listener {listener} failed: {reason}"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SyncLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while sync is in state {current:?}"),
        )
    }

    /// Whether the poll loop should back off and retry on this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Network | SyncErrorCategory::Server | SyncErrorCategory::RateLimited
        )
    }

    /// Retry hint as a duration, when the server supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Map HTTP status codes to sync error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 | 429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Server,
        _ => SyncErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(403), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(429), SyncErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), SyncErrorCategory::Config);
        assert_eq!(classify_http_status(502), SyncErrorCategory::Server);
        assert_eq!(classify_http_status(700), SyncErrorCategory::Internal);
    }

    #[test]
    fn only_network_server_and_rate_limit_are_transient() {
        let transient = [
            SyncErrorCategory::Network,
            SyncErrorCategory::Server,
            SyncErrorCategory::RateLimited,
        ];
        let permanent = [
            SyncErrorCategory::Malformed,
            SyncErrorCategory::Auth,
            SyncErrorCategory::Config,
            SyncErrorCategory::Listener,
            SyncErrorCategory::Internal,
        ];

        for category in transient {
            assert!(SyncError::new(category, "x", "x").is_transient());
        }
        for category in permanent {
            assert!(!SyncError::new(category, "x", "x").is_transient());
        }
    }

    #[test]
    fn keeps_error_codes_stable() {
        let err = SyncError::invalid_state(SyncLifecycleState::Stopping, "start");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);

        assert_eq!(SyncError::malformed("no rooms").code, "malformed_response");

        let fault = SyncError::listener_fault(Uuid::nil(), "boom");
        assert_eq!(fault.code, "listener_fault");
        assert!(fault.message.ends_with("boom"));
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }
}
