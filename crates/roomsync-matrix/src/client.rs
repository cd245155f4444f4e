use std::{
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard,
        RwLockWriteGuard,
    },
    time::Duration,
};

use roomsync_core::{
    Backoff, DispatchReport, Dispatcher, InviteNotice, LeaveNotice, ListenerId, ListenerRegistry,
    ListenerResult, ListenerScope, Reconciler, Room, RoomEvent, RoomSummary, SessionState,
    StatusStream, SyncCommand, SyncConfig, SyncError, SyncErrorCategory, SyncLifecycleState,
    SyncStateMachine, SyncStatusChannel, SyncToken, Transition, Transport, User,
};
use tokio::{
    sync::Mutex,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback receiving errors the poll loop would otherwise halt on.
pub type ErrorHandler = Arc<dyn Fn(&SyncError) + Send + Sync + 'static>;

#[derive(Debug)]
struct RunningSyncTask {
    stop: CancellationToken,
    task: JoinHandle<Option<SyncError>>,
}

struct Shared<T> {
    transport: T,
    config: SyncConfig,
    session: RwLock<SessionState>,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    status: SyncStatusChannel,
    lifecycle: StdMutex<SyncStateMachine>,
    last_error: StdMutex<Option<SyncError>>,
}

impl<T: Transport> Shared<T> {
    /// Fetch, reconcile and dispatch one batch.
    async fn run_cycle(&self, timeout: Option<Duration>) -> Result<DispatchReport, SyncError> {
        let since = self.read_session().sync_token().cloned();
        let request = self.config.request(since, timeout);
        let batch = self.transport.fetch_batch(request).await?;

        let outcome = {
            let mut session = self.write_session();
            self.reconciler.apply(&mut session, batch)?
        };
        for room_id in &outcome.left_rooms {
            self.dispatcher.registry().drop_room_scopes(room_id);
        }

        let report = self.dispatcher.dispatch_all(&outcome.events)?;
        debug!(
            next_batch = %outcome.next_batch,
            events = outcome.events.len(),
            delivered = report.delivered,
            faults = report.faults.len(),
            "sync cycle complete"
        );
        Ok(report)
    }
}

impl<T> Shared<T> {
    fn finish(&self, halt: Option<&SyncError>) {
        *self.last_error() = halt.cloned();
        self.status.emit_stopped(halt.map(|err| err.code.as_str()));
        self.lifecycle().on_exit();
    }

    fn read_session(&self) -> RwLockReadGuard<'_, SessionState> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, SyncStateMachine> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_error(&self) -> MutexGuard<'_, Option<SyncError>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Long-poll sync client: owns the session, the listeners and the worker task.
pub struct SyncClient<T> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<RunningSyncTask>>,
}

impl<T> SyncClient<T>
where
    T: Transport + 'static,
{
    pub fn new(transport: T, config: SyncConfig) -> Self {
        let registry = Arc::new(ListenerRegistry::new());
        let shared = Shared {
            transport,
            session: RwLock::new(SessionState::new(config.event_history_limit)),
            reconciler: Reconciler::new(),
            dispatcher: Dispatcher::new(registry, config.fault_policy),
            status: SyncStatusChannel::new(config.status_buffer),
            lifecycle: StdMutex::new(SyncStateMachine::default()),
            last_error: StdMutex::new(None),
            config,
        };

        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Start the background poll loop.
    ///
    /// Returns `Ok(false)` when the loop is already running. `timeout`
    /// overrides the configured long-poll wait. Without `on_error`, any
    /// error that is not transient halts the loop; with it, the handler is
    /// called and polling resumes after the backoff delay.
    pub async fn start(
        &self,
        timeout: Option<Duration>,
        on_error: Option<ErrorHandler>,
    ) -> Result<bool, SyncError> {
        let mut guard = self.worker.lock().await;

        let idle = self.lifecycle() == SyncLifecycleState::Idle;
        if let Some(previous) = guard.take_if(|running| idle || running.task.is_finished()) {
            self.reap(previous).await;
        }

        let transition = self.shared.lifecycle().apply(SyncCommand::Start)?;
        if transition == Transition::Unchanged {
            return Ok(false);
        }
        *self.shared.last_error() = None;

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(supervise(shared, stop_child, timeout, on_error));

        *guard = Some(RunningSyncTask { stop, task });
        info!("sync loop started");
        Ok(true)
    }

    /// Ask the loop to stop and wait for the worker to exit.
    ///
    /// An in-flight request and its dispatch complete first; only the backoff
    /// sleep is interrupted. Returns the error that halted the loop, if any.
    /// Concurrent callers all return after the worker has exited; only the
    /// first one receives the halting error.
    pub async fn stop(&self) -> Result<(), SyncError> {
        // Held until the worker is joined; concurrent callers wait here.
        let mut guard = self.worker.lock().await;
        self.shared.lifecycle().apply(SyncCommand::Stop)?;
        let Some(running) = guard.take() else {
            return Ok(());
        };

        info!("stopping sync loop");
        running.stop.cancel();
        match self.reap(running).await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run exactly one fetch/reconcile/dispatch cycle on the caller's task.
    pub async fn sync_once(&self, timeout: Option<Duration>) -> Result<DispatchReport, SyncError> {
        // Holding the worker slot keeps `start` out until this cycle is done.
        let _guard = self.worker.lock().await;
        if self.lifecycle() != SyncLifecycleState::Idle {
            return Err(SyncError::new(
                SyncErrorCategory::Internal,
                "sync_already_running",
                "sync loop is running; stop it before syncing manually",
            ));
        }
        self.shared.run_cycle(timeout).await
    }

    pub fn lifecycle(&self) -> SyncLifecycleState {
        self.shared.lifecycle().state()
    }

    /// Error that halted the most recent run, if it halted on its own.
    pub fn last_error(&self) -> Option<SyncError> {
        self.shared.last_error().clone()
    }

    pub fn subscribe_status(&self) -> StatusStream {
        self.shared.status.subscribe()
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        self.shared.dispatcher.registry()
    }

    /// Listen to timeline events of every room, optionally of one type.
    pub fn add_listener<F>(&self, callback: F, event_type: Option<&str>) -> ListenerId
    where
        F: Fn(&RoomEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners()
            .add_global(Arc::new(callback), event_type.map(ToOwned::to_owned))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(&ListenerScope::Global, id)
    }

    pub fn add_presence_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&RoomEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners().add_presence(Arc::new(callback))
    }

    pub fn remove_presence_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(&ListenerScope::Presence, id)
    }

    pub fn add_invite_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&InviteNotice) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners().add_invite(Arc::new(callback))
    }

    pub fn remove_invite_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(&ListenerScope::Invite, id)
    }

    pub fn add_leave_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&LeaveNotice) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners().add_leave(Arc::new(callback))
    }

    pub fn remove_leave_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(&ListenerScope::Leave, id)
    }

    /// Listen to ephemeral events of every room, optionally of one type.
    pub fn add_ephemeral_listener<F>(&self, callback: F, event_type: Option<&str>) -> ListenerId
    where
        F: Fn(&RoomEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners()
            .add_ephemeral(Arc::new(callback), event_type.map(ToOwned::to_owned))
    }

    pub fn remove_ephemeral_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(&ListenerScope::Ephemeral, id)
    }

    /// Timeline events of one room; runs before the global listeners.
    pub fn add_room_listener<F>(
        &self,
        room_id: &str,
        callback: F,
        event_type: Option<&str>,
    ) -> ListenerId
    where
        F: Fn(&RoomEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners().add_room_timeline(
            room_id,
            Arc::new(callback),
            event_type.map(ToOwned::to_owned),
        )
    }

    pub fn add_room_state_listener<F>(
        &self,
        room_id: &str,
        callback: F,
        event_type: Option<&str>,
    ) -> ListenerId
    where
        F: Fn(&RoomEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners().add_room_state(
            room_id,
            Arc::new(callback),
            event_type.map(ToOwned::to_owned),
        )
    }

    pub fn add_room_ephemeral_listener<F>(
        &self,
        room_id: &str,
        callback: F,
        event_type: Option<&str>,
    ) -> ListenerId
    where
        F: Fn(&RoomEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners().add_room_ephemeral(
            room_id,
            Arc::new(callback),
            event_type.map(ToOwned::to_owned),
        )
    }

    /// Remove a room-scoped listener of any kind.
    pub fn remove_room_listener(&self, room_id: &str, id: ListenerId) -> bool {
        let room_id = room_id.to_owned();
        [
            ListenerScope::RoomTimeline(room_id.clone()),
            ListenerScope::RoomState(room_id.clone()),
            ListenerScope::RoomEphemeral(room_id),
        ]
        .iter()
        .any(|scope| self.listeners().remove(scope, id))
    }

    pub fn sync_token(&self) -> Option<SyncToken> {
        self.shared.read_session().sync_token().cloned()
    }

    /// Replace the continuation token; `None` forces a full snapshot next.
    pub fn set_sync_token(&self, token: Option<SyncToken>) {
        self.shared.write_session().set_sync_token(token);
    }

    pub fn reset_sync_token(&self) {
        self.set_sync_token(None);
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.shared.read_session().room(room_id).cloned()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.shared.read_session().rooms().cloned().collect()
    }

    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        self.shared.read_session().room_summaries()
    }

    pub fn user(&self, user_id: &str) -> Option<User> {
        self.shared.read_session().user(user_id).cloned()
    }

    pub fn users(&self) -> Vec<User> {
        self.shared.read_session().users().cloned().collect()
    }

    /// Read the session in place under the lock.
    ///
    /// The closure must not call back into this client's session accessors.
    pub fn with_session<R>(&self, read: impl FnOnce(&SessionState) -> R) -> R {
        read(&self.shared.read_session())
    }

    async fn reap(&self, running: RunningSyncTask) -> Option<SyncError> {
        match running.task.await {
            Ok(halt) => halt,
            Err(join_err) => Some(abort_worker(&self.shared, &join_err)),
        }
    }
}

impl<T> Drop for SyncClient<T> {
    fn drop(&mut self) {
        if let Some(running) = self.worker.get_mut().as_ref() {
            running.stop.cancel();
        }
    }
}

/// Run the poll loop on its own task so a panic still settles the lifecycle.
async fn supervise<T: Transport + 'static>(
    shared: Arc<Shared<T>>,
    stop: CancellationToken,
    timeout: Option<Duration>,
    on_error: Option<ErrorHandler>,
) -> Option<SyncError> {
    let worker = tokio::spawn(run_sync_loop(Arc::clone(&shared), stop, timeout, on_error));
    match worker.await {
        Ok(halt) => halt,
        Err(join_err) => Some(abort_worker(&shared, &join_err)),
    }
}

fn abort_worker<T>(shared: &Shared<T>, join_err: &JoinError) -> SyncError {
    let err = SyncError::new(
        SyncErrorCategory::Internal,
        "sync_worker_panicked",
        join_err.to_string(),
    );
    error!(error = %err, "sync worker terminated abnormally");
    shared.finish(Some(&err));
    err
}

async fn run_sync_loop<T: Transport>(
    shared: Arc<Shared<T>>,
    stop: CancellationToken,
    timeout: Option<Duration>,
    on_error: Option<ErrorHandler>,
) -> Option<SyncError> {
    shared.status.emit_running();
    let mut backoff = Backoff::new(shared.config.retry);

    let halt = loop {
        if stop.is_cancelled() {
            break None;
        }

        let err = match shared.run_cycle(timeout).await {
            Ok(_) => {
                if backoff.attempt() > 0 {
                    backoff.reset();
                    shared.status.emit_running();
                }
                continue;
            }
            Err(err) => err,
        };

        if !err.is_transient() {
            let Some(handler) = &on_error else {
                error!(code = %err.code, error = %err, "sync loop halted");
                break Some(err);
            };
            handler(&err);
        }

        let delay = backoff.next_delay(err.retry_after_ms);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        warn!(
            code = %err.code,
            attempt = backoff.attempt(),
            delay_ms,
            error = %err,
            "sync failed; backing off"
        );
        shared.status.emit_backoff(delay_ms, &err.code);

        tokio::select! {
            _ = stop.cancelled() => break None,
            _ = tokio::time::sleep(delay) => {}
        }
    };

    shared.finish(halt.as_ref());
    halt
}
