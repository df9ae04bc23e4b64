//! Script lifecycle and cooperative breakpoints.
//!
//! A script moves through
//!
//! ```text
//! Idle ──start──► Running ◄──resume── Paused
//!                   │  └────pause─────►  │
//!                  stop                 stop
//!                   ▼                    ▼
//!                Stopping ──finish──► Stopped ──start──► Running
//! ```
//!
//! The script thread calls [`ScriptControl::checkpoint`] between operations
//! (through the context breakpoint). While paused the call blocks; once a stop
//! is requested it returns [`IcsError::Aborted`], which unwinds the script.

use crate::context::Breakpoint;
use crate::daemon::auth::User;
use crate::error::{AppResult, IcsError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl fmt::Display for ScriptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptState::Idle => "idle",
            ScriptState::Running => "running",
            ScriptState::Paused => "paused",
            ScriptState::Stopping => "stopping",
            ScriptState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

impl ScriptState {
    /// Whether the state machine allows going from `self` to `next`.
    /// `Paused` back to `Running` only happens through [`ScriptControl::resume`].
    pub fn can_become(self, next: ScriptState) -> bool {
        use ScriptState::*;
        matches!(
            (self, next),
            (Idle | Stopped, Running)
                | (Running, Paused)
                | (Running | Paused, Stopping)
                | (Running, Idle)
                | (Stopping, Stopped)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, ScriptState::Running | ScriptState::Paused | ScriptState::Stopping)
    }
}

/// A script submitted to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: u64,
    pub name: String,
    pub code: String,
    pub user: User,
    /// Submission time (UNIX seconds).
    pub submitted: f64,
}

/// Shared state of the running script.
#[derive(Debug)]
pub struct ScriptControl {
    state: Mutex<ScriptState>,
    changed: Condvar,
}

impl Default for ScriptControl {
    fn default() -> Self {
        Self {
            state: Mutex::new(ScriptState::Idle),
            changed: Condvar::new(),
        }
    }
}

impl ScriptControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> ScriptState {
        *self.state.lock()
    }

    fn transition(&self, next: ScriptState) -> bool {
        let mut state = self.state.lock();
        if !state.can_become(next) {
            return false;
        }
        *state = next;
        self.changed.notify_all();
        true
    }

    pub fn start(&self) -> AppResult<()> {
        if self.transition(ScriptState::Running) {
            Ok(())
        } else {
            Err(IcsError::Script(format!(
                "cannot start a script while {}",
                self.state()
            )))
        }
    }

    pub fn pause(&self) -> bool {
        self.transition(ScriptState::Paused)
    }

    /// Continue a paused script; anything but `Paused` is left alone.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ScriptState::Paused {
            return false;
        }
        *state = ScriptState::Running;
        self.changed.notify_all();
        true
    }

    /// Request a stop; takes effect at the script's next checkpoint.
    pub fn stop(&self) -> bool {
        self.transition(ScriptState::Stopping)
    }

    /// Mark the script as ended: `Stopped` after a stop request, else `Idle`.
    pub fn finish(&self) -> ScriptState {
        let mut state = self.state.lock();
        *state = match *state {
            ScriptState::Stopping | ScriptState::Stopped => ScriptState::Stopped,
            _ => ScriptState::Idle,
        };
        self.changed.notify_all();
        *state
    }

    /// Block while paused; fail once a stop was requested.
    pub fn checkpoint(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        loop {
            match *state {
                ScriptState::Paused => self.changed.wait(&mut state),
                ScriptState::Stopping | ScriptState::Stopped => {
                    return Err(IcsError::Aborted("script stopped by request".into()))
                }
                ScriptState::Idle | ScriptState::Running => return Ok(()),
            }
        }
    }

    /// Breakpoint hook for a [`Context`](crate::context::Context).
    pub fn breakpoint(self: &Arc<Self>) -> Breakpoint {
        let control = Arc::clone(self);
        Arc::new(move || control.checkpoint())
    }
}
