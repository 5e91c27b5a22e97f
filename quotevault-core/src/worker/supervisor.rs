//! Worker supervisor: one background thread per `(symbol, role)`.
//!
//! Each key has its own slot mutex, held across stop-then-start so two
//! callers racing on the same key serialize and leave exactly one worker.
//! Stopping is cooperative first: the token is cancelled (running its close
//! hooks) and the supervisor waits up to the grace period for the thread to
//! reach `Stopped`. A worker that overstays is detached and marked
//! `Stopped(Forced)`.
//!
//! Worker bodies that fail with a restartable error are re-run by the runner
//! after a cancellable backoff.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::restart::{RestartConfig, RestartPolicy};
use super::state::{StateCell, StopKind, StoppedGuard, WorkerKey, WorkerRole, WorkerState};
use crate::error::WorkerError;
use crate::notify::{MarketEvent, Notifier};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("failed to spawn worker thread for {key}: {message}")]
    Spawn { key: WorkerKey, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub cancel_grace: Duration,
    pub restart: RestartConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_millis(2_500),
            restart: RestartConfig::default(),
        }
    }
}

/// Outcome of `shutdown_all`, in the order workers were stopped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<(WorkerKey, StopKind)>,
}

impl ShutdownReport {
    pub fn forced(&self) -> Vec<&WorkerKey> {
        self.stopped
            .iter()
            .filter(|(_, kind)| *kind == StopKind::Forced)
            .map(|(key, _)| key)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.forced().is_empty()
    }
}

struct WorkerHandle {
    token: CancelToken,
    state: Arc<StateCell>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Slot {
    handle: Option<WorkerHandle>,
    /// Final state of the last worker removed from this slot.
    last: Option<WorkerState>,
}

impl Slot {
    fn state(&self) -> WorkerState {
        match (&self.handle, self.last) {
            (Some(h), _) => h.state.get(),
            (None, Some(last)) => last,
            (None, None) => WorkerState::Idle,
        }
    }
}

type SlotRef = Arc<Mutex<Slot>>;

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    notifier: Notifier,
    slots: Mutex<HashMap<WorkerKey, SlotRef>>,
    shutting_down: AtomicBool,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig, notifier: Notifier) -> Self {
        Self {
            config,
            notifier,
            slots: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn slot(&self, key: &WorkerKey) -> SlotRef {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, key: &WorkerKey) -> Option<SlotRef> {
        self.slots.lock().get(key).cloned()
    }

    /// Start `body` under `key`, first stopping whatever already runs there.
    ///
    /// `body` is called again after a restartable failure, so it must be
    /// re-entrant. It should return promptly once its token is cancelled.
    pub fn start<F>(&self, key: WorkerKey, body: F) -> Result<(), SupervisorError>
    where
        F: FnMut(&CancelToken) -> Result<(), WorkerError> + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let slot = self.slot(&key);
        let mut slot = slot.lock();
        // Re-checked under the slot lock so shutdown never misses a worker.
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        if let Some(old) = slot.handle.take() {
            if old.state.get().is_active() {
                debug!(%key, "replacing running worker");
            }
            let deadline = Instant::now() + self.config.cancel_grace;
            signal(&old);
            slot.last = Some(WorkerState::Stopped(self.finish(&key, old, deadline)));
        }

        let token = CancelToken::new();
        let state = Arc::new(StateCell::new(WorkerState::Starting));

        let thread = {
            let worker_key = key.clone();
            let token = token.clone();
            let state = state.clone();
            let notifier = self.notifier.clone();
            let restart = self.config.restart.clone();
            thread::Builder::new()
                .name(format!("{}-{}", key.role, key.symbol))
                .spawn(move || {
                    let _stopped = StoppedGuard(&state);
                    state.mark_running();
                    run_supervised(&worker_key, &token, body, restart, &notifier);
                    notifier.send(MarketEvent::WorkerStopped {
                        key: worker_key,
                        kind: StopKind::Clean,
                    });
                })
                .map_err(|e| SupervisorError::Spawn {
                    key: key.clone(),
                    message: e.to_string(),
                })?
        };

        info!(%key, "worker started");
        slot.handle = Some(WorkerHandle {
            token,
            state,
            thread: Some(thread),
        });
        slot.last = None;
        Ok(())
    }

    /// Stop the worker under `key`. Returns `None` when nothing was registered.
    pub fn cancel(&self, key: &WorkerKey) -> Option<StopKind> {
        let slot = self.existing_slot(key)?;
        let mut slot = slot.lock();
        let handle = slot.handle.take()?;
        let deadline = Instant::now() + self.config.cancel_grace;
        signal(&handle);
        let kind = self.finish(key, handle, deadline);
        slot.last = Some(WorkerState::Stopped(kind));
        Some(kind)
    }

    /// Wait for a signalled worker until `deadline`, then join or detach it.
    fn finish(&self, key: &WorkerKey, mut handle: WorkerHandle, deadline: Instant) -> StopKind {
        if handle.state.wait_stopped(deadline) {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    warn!(%key, "worker thread panicked outside its runner");
                }
            }
            if let WorkerState::Stopped(kind) = handle.state.get() {
                return kind;
            }
            return StopKind::Clean;
        }

        handle.state.advance(WorkerState::Stopped(StopKind::Forced));
        if handle.state.get() == WorkerState::Stopped(StopKind::Clean) {
            // Stopped between the timeout and the verdict.
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
            return StopKind::Clean;
        }
        // Dropping the JoinHandle detaches the thread.
        drop(handle.thread.take());
        warn!(
            %key,
            grace_ms = self.config.cancel_grace.as_millis() as u64,
            "worker ignored stop request, detached"
        );
        self.notifier.send(MarketEvent::WorkerStopped {
            key: key.clone(),
            kind: StopKind::Forced,
        });
        StopKind::Forced
    }

    /// Stop every worker, Live first, then Refresh, then Fetch. Workers of
    /// one role are signalled together and share one grace period. Further
    /// `start` calls are refused.
    pub fn shutdown_all(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut report = ShutdownReport::default();

        for role in WorkerRole::SHUTDOWN_ORDER {
            let mut keys: Vec<WorkerKey> = self
                .slots
                .lock()
                .keys()
                .filter(|k| k.role == role)
                .cloned()
                .collect();
            keys.sort();

            let mut signalled = Vec::new();
            for key in keys {
                let Some(slot) = self.existing_slot(&key) else {
                    continue;
                };
                let handle = slot.lock().handle.take();
                if let Some(handle) = handle {
                    signal(&handle);
                    signalled.push((key, slot, handle));
                }
            }

            let deadline = Instant::now() + self.config.cancel_grace;
            for (key, slot, handle) in signalled {
                let kind = self.finish(&key, handle, deadline);
                slot.lock().last = Some(WorkerState::Stopped(kind));
                report.stopped.push((key, kind));
            }
        }

        info!(
            stopped = report.stopped.len(),
            forced = report.forced().len(),
            "supervisor shut down"
        );
        report
    }

    pub fn state(&self, key: &WorkerKey) -> WorkerState {
        self.existing_slot(key)
            .map_or(WorkerState::Idle, |slot| slot.lock().state())
    }

    /// Keys whose worker has not reached `Stopped`, sorted.
    pub fn running_keys(&self) -> Vec<WorkerKey> {
        let slots: Vec<(WorkerKey, SlotRef)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let mut keys: Vec<WorkerKey> = slots
            .into_iter()
            .filter(|(_, slot)| slot.lock().state().is_active())
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

fn signal(handle: &WorkerHandle) {
    handle.state.advance(WorkerState::Cancelling);
    handle.token.cancel();
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `body` until it succeeds, is cancelled, fails for good, or exhausts
/// its restart budget.
fn run_supervised<F>(
    key: &WorkerKey,
    token: &CancelToken,
    mut body: F,
    restart: RestartConfig,
    notifier: &Notifier,
) where
    F: FnMut(&CancelToken) -> Result<(), WorkerError>,
{
    let mut policy = RestartPolicy::new(restart);

    loop {
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| body(token)))
            .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload))));

        let err = match result {
            Ok(()) => {
                debug!(%key, "worker finished");
                return;
            }
            Err(e) if token.is_cancelled() => {
                debug!(%key, error = %e, "worker exited with error after cancel");
                return;
            }
            Err(e) => e,
        };

        if !err.is_restartable() {
            error!(%key, error = %err, "worker failed");
            notifier.send(MarketEvent::WorkerFailed {
                key: key.clone(),
                message: err.to_string(),
            });
            return;
        }

        if started.elapsed() >= policy.stable_after() {
            policy.reset();
        }
        let Some(delay) = policy.next_delay() else {
            error!(%key, attempts = policy.attempts(), error = %err, "restart budget exhausted");
            notifier.send(MarketEvent::WorkerFailed {
                key: key.clone(),
                message: err.to_string(),
            });
            return;
        };

        warn!(
            %key,
            attempt = policy.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "worker failed, restarting"
        );
        if token.wait_timeout(delay) {
            return;
        }
    }
}
