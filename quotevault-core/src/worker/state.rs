//! Worker identity and lifecycle states.

use std::fmt;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::domain::normalize_symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum WorkerRole {
    Live,
    Refresh,
    Fetch,
}

impl WorkerRole {
    /// Order in which roles are stopped at shutdown.
    pub const SHUTDOWN_ORDER: [WorkerRole; 3] = [WorkerRole::Live, WorkerRole::Refresh, WorkerRole::Fetch];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Live => "live",
            WorkerRole::Refresh => "refresh",
            WorkerRole::Fetch => "fetch",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most one worker runs per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerKey {
    pub symbol: String,
    pub role: WorkerRole,
}

impl WorkerKey {
    pub fn new(symbol: &str, role: WorkerRole) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            role,
        }
    }

    pub fn live(symbol: &str) -> Self {
        Self::new(symbol, WorkerRole::Live)
    }

    pub fn refresh(symbol: &str) -> Self {
        Self::new(symbol, WorkerRole::Refresh)
    }

    pub fn fetch(symbol: &str) -> Self {
        Self::new(symbol, WorkerRole::Fetch)
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopKind {
    /// The worker returned on its own or honored the stop request in time.
    Clean,
    /// The worker ignored the stop request past the grace period and was detached.
    Forced,
}

/// `Idle → Starting → Running → Cancelling → Stopped(Clean | Forced)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Cancelling,
    Stopped(StopKind),
}

impl WorkerState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, WorkerState::Stopped(_))
    }

    /// Starting, running or still winding down.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Running | WorkerState::Cancelling
        )
    }
}

/// State shared between a worker thread and the supervisor.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<WorkerState>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new(initial: WorkerState) -> Self {
        Self {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Apply `to` unless the worker is already stopped.
    pub(crate) fn advance(&self, to: WorkerState) {
        let mut state = self.state.lock();
        if !state.is_stopped() {
            *state = to;
            self.changed.notify_all();
        }
    }

    /// Move `Starting` to `Running`; a worker cancelled before it began keeps `Cancelling`.
    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Starting {
            *state = WorkerState::Running;
            self.changed.notify_all();
        }
    }

    /// Block until the worker reaches `Stopped` or `deadline` passes.
    pub(crate) fn wait_stopped(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while !state.is_stopped() {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.is_stopped()
    }
}

/// Marks the worker `Stopped(Clean)` when its thread leaves the runner,
/// however it leaves. A `Forced` verdict recorded by the supervisor stays.
pub(crate) struct StoppedGuard<'a>(pub(crate) &'a StateCell);

impl Drop for StoppedGuard<'_> {
    fn drop(&mut self) {
        self.0.advance(WorkerState::Stopped(StopKind::Clean));
    }
}
