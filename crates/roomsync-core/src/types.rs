use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of the poll loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SyncLifecycleState {
    /// No worker is running.
    #[default]
    Idle,
    /// Worker is polling the homeserver.
    Running,
    /// Stop was requested; worker finishes its current iteration.
    Stopping,
}

/// Opaque cursor into the homeserver's event stream (`next_batch`/`since`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SyncToken(String);

impl SyncToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A single event as delivered in a sync batch.
///
/// Only the fields the engine reads are typed; everything else (`unsigned`,
/// `redacts`, future fields) is kept in `extra` so unknown event shapes pass
/// through to listeners unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomEvent {
    /// Event type, for example `m.room.message`.
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Present (possibly empty) on state events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<u64>,
    /// Filled in by the reconciler for room-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RoomEvent {
    /// Build a bare event of the given type.
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: None,
            sender: None,
            state_key: None,
            content,
            origin_server_ts: None,
            room_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// String field of `content`, if present.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

/// `{ "events": [...] }` wrapper used by most batch sections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

impl EventList {
    pub fn new(events: Vec<RoomEvent>) -> Self {
        Self { events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Timeline section of a joined or left room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TimelineSection {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
    /// `true` when the server skipped events between batches.
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// Notification counters reported for a joined room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub notification_count: u64,
    #[serde(default)]
    pub highlight_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineSection,
    #[serde(default)]
    pub ephemeral: EventList,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub unread_notifications: UnreadNotifications,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: EventList,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LeftRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineSection,
}

/// Per-room sections of a batch, keyed by room id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RoomsSection {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<String, InvitedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<String, LeftRoom>,
}

/// One `/sync` response.
///
/// `next_batch` and `rooms` are required; they are optional here so a
/// structurally broken batch can be represented and rejected by the
/// reconciler instead of failing deep inside deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyncBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<SyncToken>,
    #[serde(default)]
    pub presence: EventList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<RoomsSection>,
}

impl SyncBatch {
    /// Empty but well-formed batch advancing to `next_batch`.
    pub fn empty(next_batch: impl Into<String>) -> Self {
        Self {
            next_batch: Some(SyncToken::new(next_batch)),
            presence: EventList::default(),
            rooms: Some(RoomsSection::default()),
        }
    }

    /// Mutable access to the rooms section, creating it when absent.
    pub fn rooms_mut(&mut self) -> &mut RoomsSection {
        self.rooms.get_or_insert_with(RoomsSection::default)
    }
}

/// Lightweight room metadata for room lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    /// Room ID.
    pub room_id: String,
    /// Display name from `m.room.name`, when set.
    pub name: Option<String>,
    /// Notification count reported by sync.
    pub unread_notifications: u64,
    /// Highlight/mention count reported by sync.
    pub highlight_count: u64,
    /// Number of joined members currently tracked.
    pub joined_members: usize,
    /// Whether the room has `m.room.encryption` state.
    pub is_encrypted: bool,
}

/// Sync loop status updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether sync is currently running.
    pub running: bool,
    /// Optional hint about next retry delay.
    pub lag_hint_ms: Option<u64>,
    /// Stable code of the error that caused the current delay or halt.
    pub error_code: Option<String>,
}
