//! Cooperative cancellation shared between a worker and its supervisor.
//!
//! A token starts live and can be cancelled exactly once. Workers poll
//! `is_cancelled()` at their suspension points or sleep through
//! `wait_timeout`, which returns early on cancel. Hooks registered with
//! `on_cancel` run on the cancelling thread; the live stream uses one to shut
//! its socket down so a blocked read returns immediately. A hook lives only as
//! long as the `CancelHook` guard returned for it, so a token reused across
//! reconnects does not pile up hooks for connections that are already gone.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    registered: Vec<(u64, Hook)>,
}

struct Inner {
    cancelled: Mutex<bool>,
    signal: Condvar,
    hooks: Mutex<Hooks>,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                signal: Condvar::new(),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Request a stop. Idempotent; hooks run once, on the first call.
    pub fn cancel(&self) {
        {
            let mut cancelled = self.inner.cancelled.lock();
            if *cancelled {
                return;
            }
            *cancelled = true;
            self.inner.signal.notify_all();
        }
        let hooks = std::mem::take(&mut self.inner.hooks.lock().registered);
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Run `hook` when the token is cancelled, or right away if it already is.
    ///
    /// Dropping the returned guard deregisters the hook without running it.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelHook {
        let mut hooks = self.inner.hooks.lock();
        // Checked under the hooks lock: `cancel` drains hooks after setting
        // the flag, so a hook pushed here is either drained or run inline.
        if self.is_cancelled() {
            drop(hooks);
            hook();
            return CancelHook { inner: Weak::new(), id: 0 };
        }
        let id = hooks.next_id;
        hooks.next_id += 1;
        hooks.registered.push((id, Box::new(hook)));
        CancelHook {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Hooks still waiting for a cancel.
    pub fn registered_hooks(&self) -> usize {
        self.inner.hooks.lock().registered.len()
    }

    /// Block for up to `timeout`. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .signal
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }

    /// Sleep `total` in slices of at most `slice`, checking for cancellation
    /// between slices. Returns true if cancelled.
    pub fn sleep_sliced(&self, total: Duration, slice: Duration) -> bool {
        let slice = slice.max(Duration::from_millis(1));
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.is_cancelled();
            }
            if self.wait_timeout(slice.min(deadline - now)) {
                return true;
            }
        }
    }
}

/// Keeps an `on_cancel` hook registered; dropping it removes the hook.
#[must_use = "dropping the guard deregisters the hook"]
pub struct CancelHook {
    inner: Weak<Inner>,
    id: u64,
}

impl std::fmt::Debug for CancelHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHook").field("id", &self.id).finish()
    }
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // Take the hook out before dropping it so its captures are released
        // outside the lock.
        let removed = {
            let mut hooks = inner.hooks.lock();
            let index = hooks.registered.iter().position(|(id, _)| *id == self.id);
            index.map(|i| hooks.registered.swap_remove(i))
        };
        drop(removed);
    }
}
