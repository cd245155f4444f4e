use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    error::SyncError,
    types::{SyncBatch, SyncToken},
};

/// Parameters of one long-poll request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Continuation token; `None` asks for a full snapshot.
    pub since: Option<SyncToken>,
    /// How long the server may hold the request open.
    pub timeout: Duration,
    /// Serialized filter definition.
    pub filter: Option<String>,
    pub full_state: bool,
    /// Presence to advertise while polling (`online`, `offline`, `unavailable`).
    pub set_presence: Option<String>,
}

impl SyncRequest {
    pub fn new(since: Option<SyncToken>, timeout: Duration) -> Self {
        Self {
            since,
            timeout,
            filter: None,
            full_state: false,
            set_presence: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_set_presence(mut self, presence: Option<String>) -> Self {
        self.set_presence = presence;
        self
    }

    pub fn with_full_state(mut self, full_state: bool) -> Self {
        self.full_state = full_state;
        self
    }

    /// Wait timeout in whole milliseconds, as sent on the wire.
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Source of sync batches.
///
/// Implementations handle rate limiting internally and surface everything
/// else as a categorized [`SyncError`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_batch(&self, request: SyncRequest) -> Result<SyncBatch, SyncError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn fetch_batch(&self, request: SyncRequest) -> Result<SyncBatch, SyncError> {
        (**self).fetch_batch(request).await
    }
}
