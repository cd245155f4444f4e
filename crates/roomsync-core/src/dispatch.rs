use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{
    error::SyncError,
    event::SyncEvent,
    listeners::{ListenerError, ListenerId, ListenerRegistry, ListenerResult, Registration},
};

/// What dispatch does when a callback returns an error or panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Abort the remaining dispatch for the batch and surface `ListenerFault`.
    #[default]
    Propagate,
    /// Log the fault, record it in the report and keep dispatching.
    Isolate,
}

impl FaultPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "propagate" => Some(Self::Propagate),
            "isolate" => Some(Self::Isolate),
            _ => None,
        }
    }
}

/// Summary of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Successful callback invocations.
    pub delivered: usize,
    /// Faults swallowed under [`FaultPolicy::Isolate`].
    pub faults: Vec<SyncError>,
}

/// Routes reconciled events to the matching listeners, in order.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ListenerRegistry>,
    policy: FaultPolicy,
}

impl Dispatcher {
    pub fn new(registry: Arc<ListenerRegistry>, policy: FaultPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Dispatch a batch's events in order.
    ///
    /// Listener sets are snapshotted per event, so a listener removed by an
    /// earlier callback is not invoked for later events.
    pub fn dispatch_all(&self, events: &[SyncEvent]) -> Result<DispatchReport, SyncError> {
        let mut report = DispatchReport::default();
        for event in events {
            self.dispatch(event, &mut report)?;
        }
        Ok(report)
    }

    fn dispatch(&self, event: &SyncEvent, report: &mut DispatchReport) -> Result<(), SyncError> {
        trace!(kind = ?event.kind(), event_type = event.event_type(), "dispatching event");
        match event {
            SyncEvent::Presence(presence) => {
                self.run(self.registry.presence_targets(), presence, report)
            }
            SyncEvent::Invite(notice) => self.run(self.registry.invite_targets(), notice, report),
            SyncEvent::Leave(notice) => self.run(self.registry.leave_targets(), notice, report),
            SyncEvent::State { room_id, event } => self.run(
                self.registry.state_targets(room_id, &event.event_type),
                event,
                report,
            ),
            SyncEvent::Timeline { room_id, event } => self.run(
                self.registry.timeline_targets(room_id, &event.event_type),
                event,
                report,
            ),
            SyncEvent::Ephemeral { room_id, event } => self.run(
                self.registry.ephemeral_targets(room_id, &event.event_type),
                event,
                report,
            ),
        }
    }

    fn run<T>(
        &self,
        targets: Vec<Registration<T>>,
        payload: &T,
        report: &mut DispatchReport,
    ) -> Result<(), SyncError> {
        for target in targets {
            match invoke_guarded(&target, payload) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    let fault = SyncError::listener_fault(target.id, err.message());
                    match self.policy {
                        FaultPolicy::Propagate => return Err(fault),
                        FaultPolicy::Isolate => {
                            log_isolated_fault(target.id, &fault);
                            report.faults.push(fault);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Invoke a callback, turning a panic into a listener error.
fn invoke_guarded<T>(target: &Registration<T>, payload: &T) -> ListenerResult {
    catch_unwind(AssertUnwindSafe(|| target.invoke(payload)))
        .unwrap_or_else(|panic| Err(ListenerError::new(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_owned()
    }
}

fn log_isolated_fault(listener: ListenerId, fault: &SyncError) {
    warn!(%listener, error = %fault, "listener failed; continuing dispatch");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{
        error::SyncErrorCategory,
        event::{InviteNotice, LeaveNotice},
        listeners::{ListenerError, ListenerScope},
        types::{LeftRoom, RoomEvent},
    };

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, label: &'static str) -> Arc<dyn Fn(&RoomEvent) -> Result<(), ListenerError> + Send + Sync> {
        let log = Arc::clone(log);
        Arc::new(move |event: &RoomEvent| {
            log.lock()
                .expect("log lock")
                .push(format!("{label}:{}", event.event_type));
            Ok(())
        })
    }

    fn timeline(room_id: &str, event_type: &str) -> SyncEvent {
        SyncEvent::Timeline {
            room_id: room_id.to_owned(),
            event: RoomEvent::new(event_type, json!({})),
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().expect("log lock").clone()
    }

    #[test]
    fn filtered_listener_runs_before_unfiltered_in_registration_order() {
        let registry = Arc::new(ListenerRegistry::new());
        let log: Log = Arc::default();
        registry.add_global(record(&log, "L1"), Some("A".into()));
        registry.add_global(record(&log, "L2"), None);

        let dispatcher = Dispatcher::new(Arc::clone(&registry), FaultPolicy::Propagate);
        dispatcher
            .dispatch_all(&[timeline("!r:example.org", "A"), timeline("!r:example.org", "B")])
            .expect("dispatch should succeed");

        assert_eq!(entries(&log), vec!["L1:A", "L2:A", "L2:B"]);
    }

    #[test]
    fn routes_each_kind_to_its_own_scope() {
        let registry = Arc::new(ListenerRegistry::new());
        let log: Log = Arc::default();
        registry.add_global(record(&log, "global"), None);
        registry.add_presence(record(&log, "presence"));
        registry.add_ephemeral(record(&log, "ephemeral"), None);
        registry.add_room_state("!r:example.org", record(&log, "state"), None);
        registry.add_room_timeline("!r:example.org", record(&log, "room"), None);
        {
            let log = Arc::clone(&log);
            registry.add_invite(Arc::new(move |notice: &InviteNotice| {
                log.lock()
                    .expect("log lock")
                    .push(format!("invite:{}", notice.room_id));
                Ok(())
            }));
        }
        {
            let log = Arc::clone(&log);
            registry.add_leave(Arc::new(move |notice: &LeaveNotice| {
                log.lock()
                    .expect("log lock")
                    .push(format!("leave:{}", notice.room_id));
                Ok(())
            }));
        }

        let events = vec![
            SyncEvent::Presence(RoomEvent::new("m.presence", json!({}))),
            SyncEvent::Invite(InviteNotice {
                room_id: "!i:example.org".into(),
                invite_state: Vec::new(),
            }),
            SyncEvent::Leave(LeaveNotice {
                room_id: "!l:example.org".into(),
                last_known: None,
                section: LeftRoom::default(),
            }),
            SyncEvent::State {
                room_id: "!r:example.org".into(),
                event: RoomEvent::new("m.room.name", json!({})),
            },
            timeline("!r:example.org", "m.room.message"),
            SyncEvent::Ephemeral {
                room_id: "!r:example.org".into(),
                event: RoomEvent::new("m.typing", json!({})),
            },
        ];

        let dispatcher = Dispatcher::new(registry, FaultPolicy::Propagate);
        let report = dispatcher.dispatch_all(&events).expect("dispatch");

        assert_eq!(
            entries(&log),
            vec![
                "presence:m.presence",
                "invite:!i:example.org",
                "leave:!l:example.org",
                "state:m.room.name",
                "room:m.room.message",
                "global:m.room.message",
                "ephemeral:m.typing",
            ]
        );
        assert_eq!(report.delivered, 7);
    }

    #[test]
    fn room_listeners_ignore_other_rooms() {
        let registry = Arc::new(ListenerRegistry::new());
        let log: Log = Arc::default();
        registry.add_room_timeline("!mine:example.org", record(&log, "mine"), None);

        Dispatcher::new(registry, FaultPolicy::Propagate)
            .dispatch_all(&[timeline("!other:example.org", "m.room.message")])
            .expect("dispatch");

        assert!(entries(&log).is_empty());
    }

    #[test]
    fn propagate_policy_aborts_remaining_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let log: Log = Arc::default();
        registry.add_global(record(&log, "before"), None);
        let failing = registry.add_global(Arc::new(|_: &RoomEvent| Err(ListenerError::new("boom"))), None);
        registry.add_global(record(&log, "after"), None);

        let err = Dispatcher::new(registry, FaultPolicy::Propagate)
            .dispatch_all(&[timeline("!r:example.org", "A"), timeline("!r:example.org", "B")])
            .expect_err("fault should propagate");

        assert_eq!(err.category, SyncErrorCategory::Listener);
        assert!(err.message.contains(&failing.to_string()));
        assert_eq!(entries(&log), vec!["before:A"]);
    }

    #[test]
    fn isolate_policy_keeps_dispatching_and_reports_faults() {
        let registry = Arc::new(ListenerRegistry::new());
        let log: Log = Arc::default();
        registry.add_global(Arc::new(|_: &RoomEvent| Err(ListenerError::new("boom"))), None);
        registry.add_global(record(&log, "after"), None);

        let report = Dispatcher::new(registry, FaultPolicy::Isolate)
            .dispatch_all(&[timeline("!r:example.org", "A"), timeline("!r:example.org", "B")])
            .expect("isolated faults do not fail dispatch");

        assert_eq!(entries(&log), vec!["after:A", "after:B"]);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.faults.len(), 2);
        assert!(report.faults.iter().all(|f| f.code == "listener_fault"));
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let registry = Arc::new(ListenerRegistry::new());
        let log: Log = Arc::default();
        registry.add_global(
            Arc::new(|_: &RoomEvent| -> ListenerResult { panic!("callback exploded") }),
            None,
        );
        registry.add_global(record(&log, "after"), None);

        let report = Dispatcher::new(registry, FaultPolicy::Isolate)
            .dispatch_all(&[timeline("!r:example.org", "A")])
            .expect("isolated panics do not fail dispatch");

        assert_eq!(entries(&log), vec!["after:A"]);
        assert_eq!(report.faults.len(), 1);
        assert!(report.faults[0].message.contains("callback exploded"));
    }

    #[test]
    fn panicking_listener_propagates_as_fault() {
        let registry = Arc::new(ListenerRegistry::new());
        let log: Log = Arc::default();
        registry.add_global(
            Arc::new(|_: &RoomEvent| -> ListenerResult { panic!("callback exploded") }),
            None,
        );
        registry.add_global(record(&log, "after"), None);

        let err = Dispatcher::new(registry, FaultPolicy::Propagate)
            .dispatch_all(&[timeline("!r:example.org", "A")])
            .expect_err("panic should surface as a fault");

        assert_eq!(err.category, SyncErrorCategory::Listener);
        assert_eq!(err.code, "listener_fault");
        assert!(err.message.contains("panicked: callback exploded"));
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn listener_can_remove_itself_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(Mutex::new(0_u32));
        let own_id: Arc<Mutex<Option<ListenerId>>> = Arc::default();

        let id = {
            let registry_for_cb = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            registry.add_global(
                Arc::new(move |_: &RoomEvent| {
                    *calls.lock().expect("calls lock") += 1;
                    if let Some(id) = *own_id.lock().expect("id lock") {
                        registry_for_cb.remove(&ListenerScope::Global, id);
                    }
                    Ok(())
                }),
                None,
            )
        };
        *own_id.lock().expect("id lock") = Some(id);

        let log: Log = Arc::default();
        registry.add_global(record(&log, "other"), None);

        Dispatcher::new(Arc::clone(&registry), FaultPolicy::Propagate)
            .dispatch_all(&[timeline("!r:example.org", "A"), timeline("!r:example.org", "B")])
            .expect("dispatch");

        assert_eq!(*calls.lock().expect("calls lock"), 1);
        // The second listener still saw the first event despite the removal.
        assert_eq!(entries(&log), vec!["other:A", "other:B"]);
        assert_eq!(registry.len(&ListenerScope::Global), 1);
    }

    #[test]
    fn zero_listeners_and_events_are_noops() {
        let dispatcher = Dispatcher::new(Arc::new(ListenerRegistry::new()), FaultPolicy::default());
        let report = dispatcher
            .dispatch_all(&[timeline("!r:example.org", "A")])
            .expect("dispatch");
        assert_eq!(report, DispatchReport::default());
        assert_eq!(
            dispatcher.dispatch_all(&[]).expect("dispatch"),
            DispatchReport::default()
        );
    }

    #[test]
    fn parses_fault_policy_names() {
        assert_eq!(FaultPolicy::parse("Isolate"), Some(FaultPolicy::Isolate));
        assert_eq!(FaultPolicy::parse(" propagate "), Some(FaultPolicy::Propagate));
        assert_eq!(FaultPolicy::parse("ignore"), None);
    }
}
