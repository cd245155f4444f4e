//! Core of the long-poll sync engine.
//!
//! This crate owns everything that does not need a network stack: wire types,
//! the session store, the batch reconciler, listener registries and dispatch,
//! plus the lifecycle, retry and error abstractions the poll loop is built on.

/// Status broadcast channel for poll-loop updates.
pub mod channel;
/// Engine tunables and request construction.
pub mod config;
/// Ordered listener fan-out and fault policy.
pub mod dispatch;
/// Stable sync error types and HTTP classification helpers.
pub mod error;
/// Dispatch actions produced by reconciliation.
pub mod event;
/// Listener registrations and registries.
pub mod listeners;
/// Batch validation and application.
pub mod reconcile;
/// Backoff policy used by retry loops.
pub mod retry;
/// Rooms, users and the continuation token.
pub mod session;
/// Poll-loop lifecycle state machine.
pub mod state_machine;
/// Bounded per-room timeline buffer.
pub mod timeline;
/// Transport seam used by the poll loop.
pub mod transport;
/// Wire and status types.
pub mod types;

pub use channel::{StatusStream, SyncStatusChannel};
pub use config::{DEFAULT_TIMELINE_LIMIT, DEFAULT_WAIT_TIMEOUT, SyncConfig};
pub use dispatch::{DispatchReport, Dispatcher, FaultPolicy};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use event::{EventKind, InviteNotice, LeaveNotice, SyncEvent};
pub use listeners::{
    Callback, ListenerError, ListenerId, ListenerRegistry, ListenerResult, ListenerScope,
    ListenerSet,
};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use retry::{Backoff, RetryPolicy};
pub use session::{
    DEFAULT_EVENT_HISTORY_LIMIT, Membership, PresenceState, Room, SessionState, User,
};
pub use state_machine::{SyncCommand, SyncStateMachine, Transition};
pub use timeline::TimelineBuffer;
pub use transport::{SyncRequest, Transport};
pub use types::{
    EventList, InvitedRoom, JoinedRoom, LeftRoom, RoomEvent, RoomSummary, RoomsSection,
    SyncBatch, SyncLifecycleState, SyncStatus, SyncToken, TimelineSection, UnreadNotifications,
};
