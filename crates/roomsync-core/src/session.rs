//! Authoritative in-process store of the continuation token, rooms and users.
//!
//! Rooms reference their members by user id; the single [`User`] value per id
//! lives in [`SessionState`] and is updated in place, so every room observes
//! the same profile and presence data.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::{
    timeline::TimelineBuffer,
    types::{RoomEvent, RoomSummary, SyncToken, UnreadNotifications},
};

/// Default number of timeline events retained per room.
pub const DEFAULT_EVENT_HISTORY_LIMIT: usize = 20;

/// Presence as reported by `m.presence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Unavailable,
    Offline,
    /// Any value not defined by the protocol, kept verbatim.
    Other(String),
}

impl PresenceState {
    pub fn parse(value: &str) -> Self {
        match value {
            "online" => Self::Online,
            "unavailable" => Self::Unavailable,
            "offline" => Self::Offline,
            other => Self::Other(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    user_id: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
    presence: Option<PresenceState>,
    status_msg: Option<String>,
    last_active_ago_ms: Option<u64>,
    currently_active: Option<bool>,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            avatar_url: None,
            presence: None,
            status_msg: None,
            last_active_ago_ms: None,
            currently_active: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn avatar_url(&self) -> Option<&str> {
        self.avatar_url.as_deref()
    }

    pub fn presence(&self) -> Option<&PresenceState> {
        self.presence.as_ref()
    }

    pub fn status_msg(&self) -> Option<&str> {
        self.status_msg.as_deref()
    }

    pub fn last_active_ago_ms(&self) -> Option<u64> {
        self.last_active_ago_ms
    }

    pub fn currently_active(&self) -> Option<bool> {
        self.currently_active
    }

    /// Apply profile fields from `m.room.member` content.
    pub fn apply_profile(&mut self, content: &Value) {
        if let Some(name) = content.get("displayname") {
            self.display_name = name.as_str().map(ToOwned::to_owned);
        }
        if let Some(avatar) = content.get("avatar_url") {
            self.avatar_url = avatar.as_str().map(ToOwned::to_owned);
        }
    }

    /// Apply `m.presence` content.
    pub fn apply_presence(&mut self, content: &Value) {
        if let Some(presence) = content.get("presence").and_then(Value::as_str) {
            self.presence = Some(PresenceState::parse(presence));
        }
        if let Some(status) = content.get("status_msg") {
            self.status_msg = status.as_str().map(ToOwned::to_owned);
        }
        if let Some(ago) = content.get("last_active_ago").and_then(Value::as_u64) {
            self.last_active_ago_ms = Some(ago);
        }
        if let Some(active) = content.get("currently_active").and_then(Value::as_bool) {
            self.currently_active = Some(active);
        }
        // Presence may carry profile fields too.
        self.apply_profile(content);
    }
}

/// Our own membership in a tracked room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Joined,
    Invited,
}

/// Change to a room's joined member set caused by an `m.room.member` event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MemberChange {
    Joined { user_id: String, content: Value },
    Departed { user_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    room_id: String,
    membership: Membership,
    timeline: TimelineBuffer,
    state: BTreeMap<(String, String), RoomEvent>,
    ephemeral: BTreeMap<String, RoomEvent>,
    account_data: BTreeMap<String, Value>,
    prev_batch: Option<String>,
    members: BTreeSet<String>,
    unread: UnreadNotifications,
}

impl Room {
    pub fn new(room_id: impl Into<String>, event_history_limit: usize) -> Self {
        Self {
            room_id: room_id.into(),
            membership: Membership::Joined,
            timeline: TimelineBuffer::new(event_history_limit),
            state: BTreeMap::new(),
            ephemeral: BTreeMap::new(),
            account_data: BTreeMap::new(),
            prev_batch: None,
            members: BTreeSet::new(),
            unread: UnreadNotifications::default(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn timeline(&self) -> &[RoomEvent] {
        self.timeline.items()
    }

    /// Pagination cursor for history older than the timeline.
    pub fn prev_batch(&self) -> Option<&str> {
        self.prev_batch.as_deref()
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<&RoomEvent> {
        self.state
            .get(&(event_type.to_owned(), state_key.to_owned()))
    }

    /// Current state snapshot ordered by `(event_type, state_key)`.
    pub fn state_events(&self) -> impl Iterator<Item = &RoomEvent> {
        self.state.values()
    }

    pub fn state_len(&self) -> usize {
        self.state.len()
    }

    /// Latest ephemeral event of the given type.
    pub fn ephemeral(&self, event_type: &str) -> Option<&RoomEvent> {
        self.ephemeral.get(event_type)
    }

    pub fn account_data(&self, event_type: &str) -> Option<&Value> {
        self.account_data.get(event_type)
    }

    /// Joined member ids; resolve them through [`SessionState::user`].
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    pub fn unread_notifications(&self) -> UnreadNotifications {
        self.unread
    }

    pub fn name(&self) -> Option<&str> {
        self.state_content_str("m.room.name", "name")
    }

    pub fn topic(&self) -> Option<&str> {
        self.state_content_str("m.room.topic", "topic")
    }

    pub fn canonical_alias(&self) -> Option<&str> {
        self.state_content_str("m.room.canonical_alias", "alias")
    }

    pub fn join_rule(&self) -> Option<&str> {
        self.state_content_str("m.room.join_rules", "join_rule")
    }

    pub fn guest_access(&self) -> Option<&str> {
        self.state_content_str("m.room.guest_access", "guest_access")
    }

    pub fn is_encrypted(&self) -> bool {
        self.state_event("m.room.encryption", "").is_some()
    }

    /// Users currently typing, from the latest `m.typing` event.
    pub fn typing_user_ids(&self) -> Vec<String> {
        self.ephemeral("m.typing")
            .and_then(|event| event.content.get("user_ids"))
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id.clone(),
            name: self.name().map(ToOwned::to_owned),
            unread_notifications: self.unread.notification_count,
            highlight_count: self.unread.highlight_count,
            joined_members: self.members.len(),
            is_encrypted: self.is_encrypted(),
        }
    }

    pub(crate) fn set_membership(&mut self, membership: Membership) {
        self.membership = membership;
    }

    pub(crate) fn set_prev_batch(&mut self, prev_batch: Option<String>) {
        if prev_batch.is_some() {
            self.prev_batch = prev_batch;
        }
    }

    pub(crate) fn set_unread(&mut self, unread: UnreadNotifications) {
        self.unread = unread;
    }

    pub(crate) fn push_timeline(&mut self, event: RoomEvent) {
        self.timeline.push(event);
    }

    pub(crate) fn put_ephemeral(&mut self, event: RoomEvent) {
        self.ephemeral.insert(event.event_type.clone(), event);
    }

    pub(crate) fn put_account_data(&mut self, event: &RoomEvent) {
        self.account_data
            .insert(event.event_type.clone(), event.content.clone());
    }

    /// Store a state event (last write wins) and report member-set changes.
    ///
    /// Events without a `state_key` are ignored.
    pub(crate) fn apply_state_event(&mut self, event: &RoomEvent) -> Option<MemberChange> {
        let state_key = event.state_key.clone()?;
        self.state.insert(
            (event.event_type.clone(), state_key.clone()),
            event.clone(),
        );

        if event.event_type != "m.room.member" {
            return None;
        }

        match event.content_str("membership") {
            Some("join") => {
                self.members.insert(state_key.clone());
                Some(MemberChange::Joined {
                    user_id: state_key,
                    content: event.content.clone(),
                })
            }
            Some("leave" | "ban") => {
                self.members.remove(&state_key);
                Some(MemberChange::Departed { user_id: state_key })
            }
            _ => None,
        }
    }

    fn state_content_str(&self, event_type: &str, field: &str) -> Option<&str> {
        self.state_event(event_type, "")
            .and_then(|event| event.content_str(field))
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    sync_token: Option<SyncToken>,
    rooms: HashMap<String, Room>,
    users: HashMap<String, User>,
    event_history_limit: usize,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_HISTORY_LIMIT)
    }
}

impl SessionState {
    pub fn new(event_history_limit: usize) -> Self {
        Self {
            sync_token: None,
            rooms: HashMap::new(),
            users: HashMap::new(),
            event_history_limit: event_history_limit.max(1),
        }
    }

    /// Continuation token for the next request; `None` before the first sync.
    pub fn sync_token(&self) -> Option<&SyncToken> {
        self.sync_token.as_ref()
    }

    /// Explicitly replace (or clear) the continuation token.
    ///
    /// Clearing it makes the next request fetch a full snapshot.
    pub fn set_sync_token(&mut self, token: Option<SyncToken>) {
        self.sync_token = token;
    }

    pub fn get_or_create_room(&mut self, room_id: &str) -> &mut Room {
        let limit = self.event_history_limit;
        self.rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Room::new(room_id, limit))
    }

    /// Remove a room from the active set; absent rooms are ignored.
    pub fn drop_room(&mut self, room_id: &str) -> Option<Room> {
        self.rooms.remove(room_id)
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn get_or_create_user(&mut self, user_id: &str) -> &mut User {
        self.users
            .entry(user_id.to_owned())
            .or_insert_with(|| User::new(user_id))
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    pub(crate) fn user_mut(&mut self, user_id: &str) -> Option<&mut User> {
        self.users.get_mut(user_id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Summaries of all active rooms, sorted by room id.
    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.rooms.values().map(Room::summary).collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    /// Apply a state event to a room, keeping the shared user map in step.
    pub(crate) fn apply_room_state(&mut self, room_id: &str, event: &RoomEvent) {
        let change = self.get_or_create_room(room_id).apply_state_event(event);
        if let Some(MemberChange::Joined { user_id, content }) = change {
            self.get_or_create_user(&user_id).apply_profile(&content);
        }
    }
}
