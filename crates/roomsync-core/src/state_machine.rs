use crate::{error::SyncError, types::SyncLifecycleState};

/// Requests that drive the poll-loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    Start,
    Stop,
}

/// What the caller must do after a command was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed; act on it (spawn or signal the worker).
    Changed(SyncLifecycleState),
    /// Already in the requested state.
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStateMachine {
    state: SyncLifecycleState,
}

impl SyncStateMachine {
    pub fn state(&self) -> SyncLifecycleState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SyncLifecycleState::Running
    }

    pub fn apply(&mut self, command: SyncCommand) -> Result<Transition, SyncError> {
        match command {
            SyncCommand::Start => match self.state {
                SyncLifecycleState::Idle => Ok(self.transition(SyncLifecycleState::Running)),
                SyncLifecycleState::Running => Ok(Transition::Unchanged),
                SyncLifecycleState::Stopping => {
                    Err(SyncError::invalid_state(self.state, "start"))
                }
            },
            SyncCommand::Stop => match self.state {
                SyncLifecycleState::Running => Ok(self.transition(SyncLifecycleState::Stopping)),
                SyncLifecycleState::Idle | SyncLifecycleState::Stopping => {
                    Ok(Transition::Unchanged)
                }
            },
        }
    }

    /// The worker finished, either after a stop request or on its own.
    pub fn on_exit(&mut self) -> SyncLifecycleState {
        self.state = SyncLifecycleState::Idle;
        self.state
    }

    fn transition(&mut self, next: SyncLifecycleState) -> Transition {
        self.state = next;
        Transition::Changed(next)
    }
}
