//! Listener registries.
//!
//! Registrations are kept in insertion order. Dispatch never runs a callback
//! while holding the registry lock: it clones the matching registrations out
//! first, so callbacks may add or remove listeners (including themselves).

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;
use uuid::Uuid;

use crate::{
    event::{InviteNotice, LeaveNotice},
    types::RoomEvent,
};

/// Opaque id returned by every `add_*` call.
pub type ListenerId = Uuid;

/// Outcome of one callback invocation.
pub type ListenerResult = Result<(), ListenerError>;

/// Shared callback receiving a payload of type `T`.
pub type Callback<T> = Arc<dyn Fn(&T) -> ListenerResult + Send + Sync + 'static>;

/// Failure reported by a listener callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Where a listener is registered; needed to remove it again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerScope {
    /// Timeline events of every room.
    Global,
    Presence,
    Invite,
    Leave,
    /// Ephemeral events of every room.
    Ephemeral,
    RoomTimeline(String),
    RoomState(String),
    RoomEphemeral(String),
}

pub(crate) struct Registration<T> {
    pub(crate) id: ListenerId,
    filter: Option<String>,
    callback: Callback<T>,
}

impl<T> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            filter: self.filter.clone(),
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> Registration<T> {
    fn matches(&self, event_type: Option<&str>) -> bool {
        match (&self.filter, event_type) {
            (None, _) => true,
            (Some(filter), Some(event_type)) => filter == event_type,
            (Some(_), None) => false,
        }
    }

    pub(crate) fn invoke(&self, payload: &T) -> ListenerResult {
        (self.callback)(payload)
    }
}

/// Insertion-ordered set of registrations for one scope.
pub struct ListenerSet<T> {
    entries: Vec<Registration<T>>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<T> ListenerSet<T> {
    pub fn add(&mut self, callback: Callback<T>, filter: Option<String>) -> ListenerId {
        let id = Uuid::new_v4();
        self.entries.push(Registration {
            id,
            filter,
            callback,
        });
        id
    }

    /// Remove by id; returns whether anything was removed.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in registration order.
    pub fn ids(&self) -> Vec<ListenerId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    pub(crate) fn matching(&self, event_type: Option<&str>) -> Vec<Registration<T>> {
        self.entries
            .iter()
            .filter(|entry| entry.matches(event_type))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct Registries {
    global: ListenerSet<RoomEvent>,
    presence: ListenerSet<RoomEvent>,
    invite: ListenerSet<InviteNotice>,
    leave: ListenerSet<LeaveNotice>,
    ephemeral: ListenerSet<RoomEvent>,
    room_timeline: HashMap<String, ListenerSet<RoomEvent>>,
    room_state: HashMap<String, ListenerSet<RoomEvent>>,
    room_ephemeral: HashMap<String, ListenerSet<RoomEvent>>,
}

/// All listener sets of one client, internally synchronized.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    inner: RwLock<Registries>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeline events of any room, optionally filtered by event type.
    pub fn add_global(&self, callback: Callback<RoomEvent>, filter: Option<String>) -> ListenerId {
        self.write().global.add(callback, filter)
    }

    pub fn add_presence(&self, callback: Callback<RoomEvent>) -> ListenerId {
        self.write().presence.add(callback, None)
    }

    pub fn add_invite(&self, callback: Callback<InviteNotice>) -> ListenerId {
        self.write().invite.add(callback, None)
    }

    pub fn add_leave(&self, callback: Callback<LeaveNotice>) -> ListenerId {
        self.write().leave.add(callback, None)
    }

    pub fn add_ephemeral(
        &self,
        callback: Callback<RoomEvent>,
        filter: Option<String>,
    ) -> ListenerId {
        self.write().ephemeral.add(callback, filter)
    }

    pub fn add_room_timeline(
        &self,
        room_id: &str,
        callback: Callback<RoomEvent>,
        filter: Option<String>,
    ) -> ListenerId {
        self.write()
            .room_timeline
            .entry(room_id.to_owned())
            .or_default()
            .add(callback, filter)
    }

    pub fn add_room_state(
        &self,
        room_id: &str,
        callback: Callback<RoomEvent>,
        filter: Option<String>,
    ) -> ListenerId {
        self.write()
            .room_state
            .entry(room_id.to_owned())
            .or_default()
            .add(callback, filter)
    }

    pub fn add_room_ephemeral(
        &self,
        room_id: &str,
        callback: Callback<RoomEvent>,
        filter: Option<String>,
    ) -> ListenerId {
        self.write()
            .room_ephemeral
            .entry(room_id.to_owned())
            .or_default()
            .add(callback, filter)
    }

    /// Remove a listener; unknown ids are a no-op returning `false`.
    pub fn remove(&self, scope: &ListenerScope, id: ListenerId) -> bool {
        let mut registries = self.write();
        match scope {
            ListenerScope::Global => registries.global.remove(id),
            ListenerScope::Presence => registries.presence.remove(id),
            ListenerScope::Invite => registries.invite.remove(id),
            ListenerScope::Leave => registries.leave.remove(id),
            ListenerScope::Ephemeral => registries.ephemeral.remove(id),
            ListenerScope::RoomTimeline(room_id) => {
                remove_scoped(&mut registries.room_timeline, room_id, id)
            }
            ListenerScope::RoomState(room_id) => {
                remove_scoped(&mut registries.room_state, room_id, id)
            }
            ListenerScope::RoomEphemeral(room_id) => {
                remove_scoped(&mut registries.room_ephemeral, room_id, id)
            }
        }
    }

    /// Forget every listener bound to a room.
    pub fn drop_room_scopes(&self, room_id: &str) {
        let mut registries = self.write();
        registries.room_timeline.remove(room_id);
        registries.room_state.remove(room_id);
        registries.room_ephemeral.remove(room_id);
    }

    /// Number of listeners registered in a scope.
    pub fn len(&self, scope: &ListenerScope) -> usize {
        let registries = self.read();
        match scope {
            ListenerScope::Global => registries.global.len(),
            ListenerScope::Presence => registries.presence.len(),
            ListenerScope::Invite => registries.invite.len(),
            ListenerScope::Leave => registries.leave.len(),
            ListenerScope::Ephemeral => registries.ephemeral.len(),
            ListenerScope::RoomTimeline(room_id) => {
                registries.room_timeline.get(room_id).map_or(0, ListenerSet::len)
            }
            ListenerScope::RoomState(room_id) => {
                registries.room_state.get(room_id).map_or(0, ListenerSet::len)
            }
            ListenerScope::RoomEphemeral(room_id) => {
                registries.room_ephemeral.get(room_id).map_or(0, ListenerSet::len)
            }
        }
    }

    pub(crate) fn presence_targets(&self) -> Vec<Registration<RoomEvent>> {
        self.read().presence.matching(None)
    }

    pub(crate) fn invite_targets(&self) -> Vec<Registration<InviteNotice>> {
        self.read().invite.matching(None)
    }

    pub(crate) fn leave_targets(&self) -> Vec<Registration<LeaveNotice>> {
        self.read().leave.matching(None)
    }

    pub(crate) fn state_targets(
        &self,
        room_id: &str,
        event_type: &str,
    ) -> Vec<Registration<RoomEvent>> {
        self.read()
            .room_state
            .get(room_id)
            .map(|set| set.matching(Some(event_type)))
            .unwrap_or_default()
    }

    /// Room-scoped timeline listeners first, then global ones.
    pub(crate) fn timeline_targets(
        &self,
        room_id: &str,
        event_type: &str,
    ) -> Vec<Registration<RoomEvent>> {
        let registries = self.read();
        let mut targets = registries
            .room_timeline
            .get(room_id)
            .map(|set| set.matching(Some(event_type)))
            .unwrap_or_default();
        targets.extend(registries.global.matching(Some(event_type)));
        targets
    }

    /// Room-scoped ephemeral listeners first, then global ones.
    pub(crate) fn ephemeral_targets(
        &self,
        room_id: &str,
        event_type: &str,
    ) -> Vec<Registration<RoomEvent>> {
        let registries = self.read();
        let mut targets = registries
            .room_ephemeral
            .get(room_id)
            .map(|set| set.matching(Some(event_type)))
            .unwrap_or_default();
        targets.extend(registries.ephemeral.matching(Some(event_type)));
        targets
    }

    // A panicking callback never runs under these locks, so a poisoned lock
    // still guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, Registries> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registries> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_scoped<T>(
    sets: &mut HashMap<String, ListenerSet<T>>,
    room_id: &str,
    id: ListenerId,
) -> bool {
    let Some(set) = sets.get_mut(room_id) else {
        return false;
    };
    let removed = set.remove(id);
    if set.is_empty() {
        sets.remove(room_id);
    }
    removed
}
