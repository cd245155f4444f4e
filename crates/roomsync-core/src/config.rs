use std::time::Duration;

use serde_json::json;

use crate::{
    dispatch::FaultPolicy,
    retry::RetryPolicy,
    session::DEFAULT_EVENT_HISTORY_LIMIT,
    transport::SyncRequest,
    types::SyncToken,
};

/// Default long-poll wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of timeline events requested per room.
pub const DEFAULT_TIMELINE_LIMIT: u32 = 20;

/// Tunables of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long the server may hold each poll open.
    pub wait_timeout: Duration,
    /// Timeline events requested per room (`room.timeline.limit` filter).
    pub timeline_limit: u32,
    /// Timeline events retained per room in memory.
    pub event_history_limit: usize,
    pub retry: RetryPolicy,
    pub fault_policy: FaultPolicy,
    /// Presence advertised while polling; `None` leaves it to the server.
    pub set_presence: Option<String>,
    /// Per-subscriber buffer of the status channel.
    pub status_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            timeline_limit: DEFAULT_TIMELINE_LIMIT,
            event_history_limit: DEFAULT_EVENT_HISTORY_LIMIT,
            retry: RetryPolicy::default(),
            fault_policy: FaultPolicy::default(),
            set_presence: None,
            status_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Filter definition sent with every request.
    pub fn filter_json(&self) -> String {
        json!({"room": {"timeline": {"limit": self.timeline_limit}}}).to_string()
    }

    /// Build the request for the next poll.
    pub fn request(&self, since: Option<SyncToken>, timeout: Option<Duration>) -> SyncRequest {
        SyncRequest::new(since, timeout.unwrap_or(self.wait_timeout))
            .with_filter(self.filter_json())
            .with_set_presence(self.set_presence.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_limits_timeline_to_twenty() {
        let config = SyncConfig::default();
        let filter: serde_json::Value =
            serde_json::from_str(&config.filter_json()).expect("filter should be JSON");
        assert_eq!(filter["room"]["timeline"]["limit"], 20);
    }

    #[test]
    fn request_uses_wait_timeout_unless_overridden() {
        let config = SyncConfig {
            set_presence: Some("offline".into()),
            ..SyncConfig::default()
        };

        let request = config.request(Some(SyncToken::new("t1")), None);
        assert_eq!(request.timeout, DEFAULT_WAIT_TIMEOUT);
        assert_eq!(request.since, Some(SyncToken::new("t1")));
        assert_eq!(request.set_presence.as_deref(), Some("offline"));
        assert!(request.filter.is_some());

        let request = config.request(None, Some(Duration::from_secs(1)));
        assert_eq!(request.timeout, Duration::from_secs(1));
    }
}
