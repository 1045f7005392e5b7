//! Synchronization primitives shared by the engine.

use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Manual-reset event.
///
/// Clones share the same underlying state. Once [`set`](Self::set), every
/// current and future waiter is released until [`reset`](Self::reset).
#[derive(Clone, Default)]
pub struct WaitHandle {
    inner: Arc<WaitHandleInner>,
}

#[derive(Default)]
struct WaitHandleInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle that starts in the signaled state
    pub fn signaled() -> Self {
        let handle = Self::new();
        handle.set();
        handle
    }

    pub fn set(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.inner.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Block until the handle is signaled
    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            self.inner.cond.wait(&mut signaled);
        }
    }

    /// Block until the handle is signaled or `timeout` elapses.
    ///
    /// Returns whether the handle was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            if self
                .inner
                .cond
                .wait_until(&mut signaled, deadline)
                .timed_out()
            {
                return *signaled;
            }
        }
        true
    }
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle")
            .field("signaled", &self.is_set())
            .finish()
    }
}

/// Identifier returned by every `subscribe` call
pub type SubscriptionId = u64;

/// Callback registered through `subscribe`
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of event listeners.
///
/// `emit` works on a snapshot, so listeners may subscribe or unsubscribe
/// from inside a callback.
pub(crate) struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, Listener<E>)>>,
}

impl<E> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener<E>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
