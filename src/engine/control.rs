use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Lifecycle of a run. Only the controller thread writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RunState {
    Pending = 0,
    Ramping = 1,
    Running = 2,
    Stopping = 3,
    Completed = 4,
    Aborted = 5,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Ramping,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Completed,
            _ => Self::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Ramping | Self::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ramping => "ramping",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why the run left the active states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum StopReason {
    DurationElapsed,
    IterationsExhausted,
    Threshold(String),
    Requested,
}

/// State shared between the controller, the VU pool and run handles.
///
/// The controller is the single writer of `state`; everybody else reads the
/// published value. `stop_requested` may be set from any thread.
pub struct ControlState {
    state: AtomicU8,
    stop_requested: AtomicBool,
    active_vus: AtomicUsize,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Pending as u8),
            stop_requested: AtomicBool::new(false),
            active_vus: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn publish(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active_vus(&self, n: usize) {
        self.active_vus.store(n, Ordering::Relaxed);
    }

    pub fn active_vus(&self) -> usize {
        self.active_vus.load(Ordering::Relaxed)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}
