use tokio::sync::broadcast;

use crate::types::SyncStatus;

/// Broadcast status stream handed to subscribers.
pub type StatusStream = broadcast::Receiver<SyncStatus>;

/// Fan-out channel for poll-loop status updates.
#[derive(Clone, Debug)]
pub struct SyncStatusChannel {
    status_tx: broadcast::Sender<SyncStatus>,
}

impl SyncStatusChannel {
    /// Create a channel buffering up to `buffer` updates per slow subscriber.
    pub fn new(buffer: usize) -> Self {
        let (status_tx, _) = broadcast::channel(buffer.max(1));
        Self { status_tx }
    }

    /// Subscribe to status updates published from now on.
    pub fn subscribe(&self) -> StatusStream {
        self.status_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.status_tx.receiver_count()
    }

    /// Publish one status update.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, status: SyncStatus) {
        let _ = self.status_tx.send(status);
    }

    pub fn emit_running(&self) {
        self.emit(SyncStatus {
            running: true,
            lag_hint_ms: None,
            error_code: None,
        });
    }

    /// Publish a backoff delay caused by `error_code`.
    pub fn emit_backoff(&self, delay_ms: u64, error_code: &str) {
        self.emit(SyncStatus {
            running: true,
            lag_hint_ms: Some(delay_ms),
            error_code: Some(error_code.to_owned()),
        });
    }

    /// Publish that the loop is no longer running, optionally with the halting error.
    pub fn emit_stopped(&self, error_code: Option<&str>) {
        self.emit(SyncStatus {
            running: false,
            lag_hint_ms: None,
            error_code: error_code.map(ToOwned::to_owned),
        });
    }
}

impl Default for SyncStatusChannel {
    fn default() -> Self {
        Self::new(64)
    }
}
