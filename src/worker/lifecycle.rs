use parking_lot::Mutex;
use std::fmt;

use super::event::EventKind;

/// Lifecycle of one worker handle.
///
/// `Spawning -> Running -> Terminated | Closed`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Spawning,
    Running,
    /// Stopped by the owner, or the context went away without a close request
    Terminated,
    /// The context asked to close itself
    Closed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Closed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Spawning => "spawning",
            LifecycleState::Running => "running",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Serialized state machine shared by the owner side and the delivery path.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Spawning),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// `Spawning -> Running`. Fails if the handle was terminated first.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if *state == LifecycleState::Spawning {
            *state = LifecycleState::Running;
            true
        } else {
            false
        }
    }

    /// Owner-initiated termination. Returns `true` only for the call that
    /// actually performed the transition.
    pub fn terminate(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = LifecycleState::Terminated;
        true
    }

    /// Decide whether an event of `kind` may reach listeners.
    ///
    /// Messages pass only while running. A close passes once, from
    /// `Running`, and moves the handle to `Closed`. Errors pass until the
    /// handle is terminal.
    pub fn admit(&self, kind: EventKind) -> bool {
        let mut state = self.state.lock();
        match kind {
            EventKind::Message => *state == LifecycleState::Running,
            EventKind::Close => {
                if *state == LifecycleState::Running {
                    *state = LifecycleState::Closed;
                    true
                } else {
                    false
                }
            }
            EventKind::Error => !state.is_terminal(),
        }
    }

    /// The context is gone. Anything not yet terminal becomes `Terminated`.
    pub fn reclaim(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = LifecycleState::Terminated;
        }
    }
}
