use crate::{
    session::Room,
    types::{LeftRoom, RoomEvent},
};

/// Category of a dispatched event; decides which listener sets see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Presence,
    Invite,
    Leave,
    State,
    Timeline,
    Ephemeral,
}

/// Payload handed to invite listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct InviteNotice {
    pub room_id: String,
    /// Stripped state the inviter chose to share.
    pub invite_state: Vec<RoomEvent>,
}

/// Payload handed to leave listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveNotice {
    pub room_id: String,
    /// Room as it was just before it was dropped; `None` if it was never tracked.
    pub last_known: Option<Room>,
    /// The leave section as the server sent it.
    pub section: LeftRoom,
}

/// One dispatch action produced by reconciling a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Presence(RoomEvent),
    Invite(InviteNotice),
    Leave(LeaveNotice),
    State { room_id: String, event: RoomEvent },
    Timeline { room_id: String, event: RoomEvent },
    Ephemeral { room_id: String, event: RoomEvent },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Presence(_) => EventKind::Presence,
            Self::Invite(_) => EventKind::Invite,
            Self::Leave(_) => EventKind::Leave,
            Self::State { .. } => EventKind::State,
            Self::Timeline { .. } => EventKind::Timeline,
            Self::Ephemeral { .. } => EventKind::Ephemeral,
        }
    }

    /// Event type string used for listener filters; `None` for invite/leave.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::Presence(event)
            | Self::State { event, .. }
            | Self::Timeline { event, .. }
            | Self::Ephemeral { event, .. } => Some(event.event_type.as_str()),
            Self::Invite(_) | Self::Leave(_) => None,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Presence(_) => None,
            Self::Invite(notice) => Some(notice.room_id.as_str()),
            Self::Leave(notice) => Some(notice.room_id.as_str()),
            Self::State { room_id, .. }
            | Self::Timeline { room_id, .. }
            | Self::Ephemeral { room_id, .. } => Some(room_id.as_str()),
        }
    }
}
