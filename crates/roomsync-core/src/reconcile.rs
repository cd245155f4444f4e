//! Applies one sync batch to [`SessionState`].
//!
//! Validation happens up front and is the only way [`Reconciler::apply`] can
//! fail. The apply phase cannot fail, and the continuation token is committed
//! after every other mutation, so a rejected batch leaves the session exactly
//! as it was.

use serde_json::Value;
use tracing::debug;

use crate::{
    error::SyncError,
    event::{InviteNotice, LeaveNotice, SyncEvent},
    session::{Membership, SessionState},
    types::{InvitedRoom, JoinedRoom, LeftRoom, RoomEvent, RoomsSection, SyncBatch, SyncToken},
};

/// Result of reconciling one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Token committed to the session.
    pub next_batch: SyncToken,
    /// Dispatch actions in the order they must be delivered.
    pub events: Vec<SyncEvent>,
    /// Rooms removed from the active set by this batch and not rejoined in it.
    pub left_rooms: Vec<String>,
}

/// Stateless batch applier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// Validate `batch`, apply it to `state` and return the dispatch actions.
    pub fn apply(
        &self,
        state: &mut SessionState,
        batch: SyncBatch,
    ) -> Result<ReconcileOutcome, SyncError> {
        let (next_batch, presence, rooms) = validate(batch)?;
        let mut events = Vec::new();
        let mut left_rooms = Vec::new();

        apply_presence(state, presence, &mut events);

        let RoomsSection {
            join,
            invite,
            leave,
        } = rooms;

        for (room_id, invited) in invite {
            apply_invite(state, room_id, invited, &mut events);
        }
        for (room_id, left) in leave {
            apply_leave(state, &room_id, left, &mut events);
            if !join.contains_key(&room_id) {
                left_rooms.push(room_id);
            }
        }
        for (room_id, joined) in join {
            apply_join(state, &room_id, joined, &mut events);
        }

        state.set_sync_token(Some(next_batch.clone()));
        debug!(
            next_batch = %next_batch,
            events = events.len(),
            left = left_rooms.len(),
            rooms = state.room_count(),
            "reconciled sync batch"
        );

        Ok(ReconcileOutcome {
            next_batch,
            events,
            left_rooms,
        })
    }
}

fn validate(batch: SyncBatch) -> Result<(SyncToken, Vec<RoomEvent>, RoomsSection), SyncError> {
    let Some(next_batch) = batch.next_batch else {
        return Err(SyncError::malformed("batch has no next_batch token"));
    };
    if next_batch.is_empty() {
        return Err(SyncError::malformed("batch has an empty next_batch token"));
    }
    let Some(rooms) = batch.rooms else {
        return Err(SyncError::malformed("batch has no rooms section"));
    };
    Ok((next_batch, batch.presence.events, rooms))
}

fn apply_presence(state: &mut SessionState, presence: Vec<RoomEvent>, events: &mut Vec<SyncEvent>) {
    for event in presence {
        if let Some(user_id) = presence_user_id(&event)
            && let Some(user) = state.user_mut(&user_id)
        {
            user.apply_presence(&event.content);
        }
        events.push(SyncEvent::Presence(event));
    }
}

fn presence_user_id(event: &RoomEvent) -> Option<String> {
    event
        .sender
        .clone()
        .or_else(|| {
            event
                .content
                .get("user_id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
}

fn apply_invite(
    state: &mut SessionState,
    room_id: String,
    invited: InvitedRoom,
    events: &mut Vec<SyncEvent>,
) {
    state
        .get_or_create_room(&room_id)
        .set_membership(Membership::Invited);
    let mut invite_state = invited.invite_state.events;
    for event in &mut invite_state {
        event.room_id = Some(room_id.clone());
        state.apply_room_state(&room_id, event);
    }
    events.push(SyncEvent::Invite(InviteNotice {
        room_id,
        invite_state,
    }));
}

fn apply_leave(
    state: &mut SessionState,
    room_id: &str,
    left: LeftRoom,
    events: &mut Vec<SyncEvent>,
) {
    let last_known = state.drop_room(room_id);
    events.push(SyncEvent::Leave(LeaveNotice {
        room_id: room_id.to_owned(),
        last_known,
        section: left,
    }));
}

fn apply_join(
    state: &mut SessionState,
    room_id: &str,
    joined: JoinedRoom,
    events: &mut Vec<SyncEvent>,
) {
    let JoinedRoom {
        state: state_section,
        timeline,
        ephemeral,
        account_data,
        unread_notifications,
    } = joined;

    {
        let room = state.get_or_create_room(room_id);
        room.set_membership(Membership::Joined);
        room.set_prev_batch(timeline.prev_batch);
        room.set_unread(unread_notifications);
    }

    for mut event in state_section.events {
        event.room_id = Some(room_id.to_owned());
        state.apply_room_state(room_id, &event);
        events.push(SyncEvent::State {
            room_id: room_id.to_owned(),
            event,
        });
    }

    for mut event in timeline.events {
        event.room_id = Some(room_id.to_owned());
        if event.is_state() {
            state.apply_room_state(room_id, &event);
        }
        state.get_or_create_room(room_id).push_timeline(event.clone());
        events.push(SyncEvent::Timeline {
            room_id: room_id.to_owned(),
            event,
        });
    }

    for mut event in ephemeral.events {
        event.room_id = Some(room_id.to_owned());
        state.get_or_create_room(room_id).put_ephemeral(event.clone());
        events.push(SyncEvent::Ephemeral {
            room_id: room_id.to_owned(),
            event,
        });
    }

    let room = state.get_or_create_room(room_id);
    for event in &account_data.events {
        room.put_account_data(event);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        error::SyncErrorCategory,
        event::EventKind,
        types::{EventList, TimelineSection, UnreadNotifications},
    };

    const ROOM: &str = "!r1:example.org";

    fn message(event_id: &str, body: &str) -> RoomEvent {
        RoomEvent::new("m.room.message", json!({"msgtype": "m.text", "body": body}))
            .with_event_id(event_id)
            .with_sender("@alice:example.org")
    }

    fn member(user_id: &str, membership: &str, displayname: &str) -> RoomEvent {
        RoomEvent::new(
            "m.room.member",
            json!({"membership": membership, "displayname": displayname}),
        )
        .with_state_key(user_id)
        .with_sender(user_id)
    }

    fn joined(timeline: Vec<RoomEvent>) -> JoinedRoom {
        JoinedRoom {
            timeline: TimelineSection {
                events: timeline,
                limited: false,
                prev_batch: Some("p1".into()),
            },
            ..JoinedRoom::default()
        }
    }

    fn batch_with_join(next: &str, room_id: &str, room: JoinedRoom) -> SyncBatch {
        let mut batch = SyncBatch::empty(next);
        batch.rooms_mut().join.insert(room_id.to_owned(), room);
        batch
    }

    #[test]
    fn token_equals_last_successful_batch() {
        let mut state = SessionState::default();
        let reconciler = Reconciler::new();
        for token in ["t1", "t2", "t3"] {
            reconciler
                .apply(&mut state, SyncBatch::empty(token))
                .expect("empty batch should apply");
        }
        assert_eq!(state.sync_token(), Some(&SyncToken::new("t3")));
    }

    #[test]
    fn empty_batch_only_advances_token() {
        let mut state = SessionState::default();
        let reconciler = Reconciler::new();
        reconciler
            .apply(
                &mut state,
                batch_with_join("t1", ROOM, joined(vec![member("@bob:example.org", "join", "Bob")])),
            )
            .expect("join should apply");
        let rooms_before = state.room_count();
        let users_before = state.user_count();

        let outcome = reconciler
            .apply(&mut state, SyncBatch::empty("t2"))
            .expect("empty batch should apply");

        assert!(outcome.events.is_empty());
        assert_eq!(state.room_count(), rooms_before);
        assert_eq!(state.user_count(), users_before);
        assert_eq!(state.sync_token(), Some(&SyncToken::new("t2")));
    }

    #[test]
    fn joined_timeline_event_is_stored_and_emitted() {
        let mut state = SessionState::default();
        let outcome = Reconciler::new()
            .apply(
                &mut state,
                batch_with_join("t1", ROOM, joined(vec![message("$e1", "hello")])),
            )
            .expect("batch should apply");

        let room = state.room(ROOM).expect("room should be created");
        assert_eq!(room.timeline().len(), 1);
        assert_eq!(room.timeline()[0].event_id.as_deref(), Some("$e1"));
        assert_eq!(room.timeline()[0].room_id.as_deref(), Some(ROOM));
        assert_eq!(room.prev_batch(), Some("p1"));
        assert_eq!(room.membership(), Membership::Joined);

        assert_eq!(outcome.events.len(), 1);
        let SyncEvent::Timeline { room_id, event } = &outcome.events[0] else {
            panic!("expected a timeline event, got {:?}", outcome.events[0]);
        };
        assert_eq!(room_id, ROOM);
        assert_eq!(event.event_id.as_deref(), Some("$e1"));
    }

    #[test]
    fn leave_then_rejoin_yields_fresh_room() {
        let mut state = SessionState::default();
        let reconciler = Reconciler::new();
        reconciler
            .apply(
                &mut state,
                batch_with_join("t1", ROOM, joined(vec![message("$old", "before")])),
            )
            .expect("join should apply");

        let mut leave = SyncBatch::empty("t2");
        leave
            .rooms_mut()
            .leave
            .insert(ROOM.to_owned(), LeftRoom::default());
        let outcome = reconciler.apply(&mut state, leave).expect("leave should apply");
        assert!(state.room(ROOM).is_none());
        assert_eq!(outcome.left_rooms, vec![ROOM.to_owned()]);
        let SyncEvent::Leave(notice) = &outcome.events[0] else {
            panic!("expected a leave event");
        };
        let last_known = notice.last_known.as_ref().expect("room was tracked");
        assert_eq!(last_known.timeline().len(), 1);

        reconciler
            .apply(
                &mut state,
                batch_with_join("t3", ROOM, joined(vec![message("$new", "after")])),
            )
            .expect("rejoin should apply");
        let room = state.room(ROOM).expect("room should be recreated");
        let ids: Vec<_> = room
            .timeline()
            .iter()
            .filter_map(|event| event.event_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["$new"]);
    }

    #[test]
    fn leave_and_rejoin_in_one_batch_keeps_room_active() {
        let mut state = SessionState::default();
        let mut batch = batch_with_join("t1", ROOM, joined(vec![message("$back", "again")]));
        batch
            .rooms_mut()
            .leave
            .insert(ROOM.to_owned(), LeftRoom::default());

        let outcome = Reconciler::new()
            .apply(&mut state, batch)
            .expect("batch should apply");

        assert!(outcome.left_rooms.is_empty());
        assert!(matches!(outcome.events[0], SyncEvent::Leave(_)));
        let room = state.room(ROOM).expect("rejoined room should be tracked");
        assert_eq!(room.timeline().len(), 1);
    }

    #[test]
    fn leave_of_unknown_room_still_notifies() {
        let mut state = SessionState::default();
        let mut batch = SyncBatch::empty("t1");
        batch
            .rooms_mut()
            .leave
            .insert("!ghost:example.org".into(), LeftRoom::default());

        let outcome = Reconciler::new()
            .apply(&mut state, batch)
            .expect("leave should apply");
        let SyncEvent::Leave(notice) = &outcome.events[0] else {
            panic!("expected a leave event");
        };
        assert!(notice.last_known.is_none());
    }

    #[test]
    fn missing_rooms_section_is_malformed_and_leaves_token() {
        let mut state = SessionState::default();
        let reconciler = Reconciler::new();
        reconciler
            .apply(&mut state, SyncBatch::empty("t1"))
            .expect("first batch should apply");

        let broken = SyncBatch {
            next_batch: Some(SyncToken::new("t2")),
            presence: EventList::default(),
            rooms: None,
        };
        let err = reconciler
            .apply(&mut state, broken)
            .expect_err("batch without rooms must be rejected");

        assert_eq!(err.category, SyncErrorCategory::Malformed);
        assert_eq!(state.sync_token(), Some(&SyncToken::new("t1")));
    }

    #[test]
    fn missing_or_empty_token_is_malformed() {
        let mut state = SessionState::default();
        let reconciler = Reconciler::new();

        let mut no_token = batch_with_join("unused", ROOM, joined(vec![message("$e1", "x")]));
        no_token.next_batch = None;
        let err = reconciler
            .apply(&mut state, no_token)
            .expect_err("missing token must be rejected");
        assert_eq!(err.code, "malformed_response");

        let err = reconciler
            .apply(&mut state, SyncBatch::empty(""))
            .expect_err("empty token must be rejected");
        assert_eq!(err.category, SyncErrorCategory::Malformed);

        // Nothing from the rejected batches was applied.
        assert!(state.sync_token().is_none());
        assert_eq!(state.room_count(), 0);
    }

    #[test]
    fn invite_creates_room_with_stripped_state() {
        let mut state = SessionState::default();
        let mut batch = SyncBatch::empty("t1");
        batch.rooms_mut().invite.insert(
            "!inv:example.org".into(),
            InvitedRoom {
                invite_state: EventList::new(vec![
                    RoomEvent::new("m.room.name", json!({"name": "Party"})).with_state_key(""),
                ]),
            },
        );

        let outcome = Reconciler::new()
            .apply(&mut state, batch)
            .expect("invite should apply");

        let room = state.room("!inv:example.org").expect("invite creates room");
        assert_eq!(room.membership(), Membership::Invited);
        assert_eq!(room.name(), Some("Party"));
        assert_eq!(outcome.events[0].kind(), EventKind::Invite);
    }

    #[test]
    fn section_order_is_presence_invite_leave_join() {
        let mut state = SessionState::default();
        let mut batch = batch_with_join("t1", ROOM, joined(vec![message("$e1", "x")]));
        batch.presence = EventList::new(vec![
            RoomEvent::new("m.presence", json!({"presence": "online"}))
                .with_sender("@bob:example.org"),
        ]);
        batch
            .rooms_mut()
            .invite
            .insert("!inv:example.org".into(), InvitedRoom::default());
        batch
            .rooms_mut()
            .leave
            .insert("!gone:example.org".into(), LeftRoom::default());

        let outcome = Reconciler::new()
            .apply(&mut state, batch)
            .expect("batch should apply");
        let kinds: Vec<_> = outcome.events.iter().map(SyncEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Presence,
                EventKind::Invite,
                EventKind::Leave,
                EventKind::Timeline
            ]
        );
    }

    #[test]
    fn state_section_precedes_timeline_and_timeline_state_updates_snapshot() {
        let mut state = SessionState::default();
        let room = JoinedRoom {
            state: EventList::new(vec![member("@bob:example.org", "join", "Bob")]),
            timeline: TimelineSection {
                events: vec![
                    RoomEvent::new("m.room.topic", json!({"topic": "news"})).with_state_key(""),
                    message("$e1", "hi"),
                ],
                ..TimelineSection::default()
            },
            ephemeral: EventList::new(vec![RoomEvent::new(
                "m.typing",
                json!({"user_ids": ["@bob:example.org"]}),
            )]),
            account_data: EventList::new(vec![RoomEvent::new(
                "m.tag",
                json!({"tags": {"u.work": {}}}),
            )]),
            unread_notifications: UnreadNotifications {
                notification_count: 3,
                highlight_count: 1,
            },
        };

        let outcome = Reconciler::new()
            .apply(&mut state, batch_with_join("t1", ROOM, room))
            .expect("batch should apply");

        let kinds: Vec<_> = outcome.events.iter().map(SyncEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::State,
                EventKind::Timeline,
                EventKind::Timeline,
                EventKind::Ephemeral
            ]
        );

        let room = state.room(ROOM).expect("room exists");
        assert_eq!(room.topic(), Some("news"));
        assert!(room.is_member("@bob:example.org"));
        assert_eq!(room.typing_user_ids(), vec!["@bob:example.org".to_owned()]);
        assert_eq!(room.account_data("m.tag"), Some(&json!({"tags": {"u.work": {}}})));
        assert_eq!(room.unread_notifications().notification_count, 3);
        assert_eq!(
            state
                .user("@bob:example.org")
                .and_then(|user| user.display_name()),
            Some("Bob")
        );
    }

    #[test]
    fn presence_updates_known_users_only() {
        let mut state = SessionState::default();
        let reconciler = Reconciler::new();
        reconciler
            .apply(
                &mut state,
                batch_with_join(
                    "t1",
                    ROOM,
                    JoinedRoom {
                        state: EventList::new(vec![member("@bob:example.org", "join", "Bob")]),
                        ..JoinedRoom::default()
                    },
                ),
            )
            .expect("join should apply");

        let mut batch = SyncBatch::empty("t2");
        batch.presence = EventList::new(vec![
            RoomEvent::new("m.presence", json!({"presence": "online"}))
                .with_sender("@bob:example.org"),
            RoomEvent::new("m.presence", json!({"presence": "offline"}))
                .with_sender("@stranger:example.org"),
        ]);
        let outcome = reconciler.apply(&mut state, batch).expect("presence applies");

        assert_eq!(outcome.events.len(), 2);
        assert_eq!(state.user_count(), 1);
        let bob = state.user("@bob:example.org").expect("bob is known");
        assert_eq!(
            bob.presence(),
            Some(&crate::session::PresenceState::Online)
        );
    }

    #[test]
    fn unknown_event_types_pass_through() {
        let mut state = SessionState::default();
        let custom = RoomEvent::new("org.example.poll", json!({"question": "?"}));
        let outcome = Reconciler::new()
            .apply(&mut state, batch_with_join("t1", ROOM, joined(vec![custom])))
            .expect("batch should apply");

        assert_eq!(outcome.events[0].event_type(), Some("org.example.poll"));
        let room = state.room(ROOM).expect("room exists");
        assert_eq!(room.timeline()[0].content_str("question"), Some("?"));
    }

    #[test]
    fn timeline_respects_history_limit() {
        let mut state = SessionState::new(2);
        let events = (1..=5)
            .map(|i| message(&format!("$e{i}"), "x"))
            .collect();
        Reconciler::new()
            .apply(&mut state, batch_with_join("t1", ROOM, joined(events)))
            .expect("batch should apply");

        let room = state.room(ROOM).expect("room exists");
        let ids: Vec<_> = room
            .timeline()
            .iter()
            .filter_map(|event| event.event_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["$e4", "$e5"]);
    }
}
