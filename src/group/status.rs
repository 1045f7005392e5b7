use crate::sync::{Listener, Listeners, SubscriptionId};
use crate::task::StatusTally;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use tracing::{trace, warn};

/// Aggregate status of a task group
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupStatus {
    /// No task has run yet and nothing is outstanding
    Idle,
    /// Tasks are outstanding but none is running
    Pending,
    /// At least one task is running
    Running,
    /// Every finished task succeeded
    Succeeded,
    /// At least one finished task failed
    Failed,
    /// Every finished task was cancelled or stopped
    Cancelled,
    /// Finished tasks have mixed outcomes without failures
    Completed,
}

/// Point-in-time view of the group counters
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub remaining: usize,
    pub running: usize,
    pub completed: usize,
    pub max_running: usize,
    pub status: GroupStatus,
}

#[derive(Default)]
struct Counters {
    remaining: usize,
    running: usize,
    completed: usize,
}

struct StatusState {
    counters: Counters,
    max_running: usize,
    tally: StatusTally,
    status: GroupStatus,
    suspend_depth: usize,
    dirty: bool,
    disposed: bool,
}

struct Gate {
    signaled: bool,
    disposed: bool,
}

/// Owns the remaining/running/completed counters, the derived
/// [`GroupStatus`] and the scheduling gate the pump thread waits on.
///
/// Counter changes made between [`suspend_update`](Self::suspend_update) and
/// the matching [`update`](Self::update) are published as a single
/// [`StatusSnapshot`]. Outside of a batch every change is published on its
/// own. All counter mutations are expected to happen under the owning
/// group's lock.
pub struct GroupStatusManager {
    state: Mutex<StatusState>,
    gate: Mutex<Gate>,
    gate_cond: Condvar,
    listeners: Listeners<StatusSnapshot>,
}

impl GroupStatusManager {
    /// `max_running == 0` means no concurrency limit
    pub fn new(max_running: usize) -> Self {
        Self {
            state: Mutex::new(StatusState {
                counters: Counters::default(),
                max_running,
                tally: StatusTally::default(),
                status: GroupStatus::Idle,
                suspend_depth: 0,
                dirty: false,
                disposed: false,
            }),
            gate: Mutex::new(Gate {
                signaled: true,
                disposed: false,
            }),
            gate_cond: Condvar::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().counters.remaining
    }

    pub fn running(&self) -> usize {
        self.state.lock().counters.running
    }

    pub fn completed(&self) -> usize {
        self.state.lock().counters.completed
    }

    pub fn max_running(&self) -> usize {
        self.state.lock().max_running
    }

    pub(crate) fn set_max_running(&self, max_running: usize) {
        self.state.lock().max_running = max_running;
    }

    pub fn status(&self) -> GroupStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        Self::snapshot_of(&self.state.lock())
    }

    /// Whether another task may start without exceeding the limit
    pub fn has_free_slot(&self) -> bool {
        let state = self.state.lock();
        state.max_running == 0 || state.counters.running < state.max_running
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        self.listeners
            .subscribe(Arc::new(listener) as Listener<StatusSnapshot>)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Open a batch; nested batches publish when the outermost one closes
    pub fn suspend_update(&self) {
        self.state.lock().suspend_depth += 1;
    }

    /// Close a batch opened by [`suspend_update`](Self::suspend_update)
    pub fn update(&self) {
        let published = {
            let mut state = self.state.lock();
            if state.suspend_depth == 0 {
                warn!("update() called without a matching suspend_update()");
                return;
            }
            state.suspend_depth -= 1;
            if state.suspend_depth > 0 || !state.dirty {
                return;
            }
            Self::recompute(&mut state)
        };
        self.publish(published);
    }

    /// Open a batch closed when the returned guard drops
    pub fn batch(&self) -> UpdateBatch<'_> {
        self.suspend_update();
        UpdateBatch { manager: self }
    }

    pub fn add_remaining(&self, count: usize) {
        if count > 0 {
            self.mutate(|counters| counters.remaining += count);
        }
    }

    pub fn remove_remaining(&self, count: usize) {
        if count > 0 {
            self.mutate(|counters| {
                counters.remaining = Self::checked_decrement("remaining", counters.remaining, count)
            });
        }
    }

    pub fn increment_running(&self) {
        self.mutate(|counters| counters.running += 1);
    }

    pub fn decrement_running(&self) {
        self.mutate(|counters| {
            counters.running = Self::checked_decrement("running", counters.running, 1)
        });
    }

    pub fn increment_completed(&self) {
        self.mutate(|counters| counters.completed += 1);
    }

    /// Re-derive the status after individual task statuses changed.
    ///
    /// Publishes only if the derived status differs from the current one.
    /// Always wakes the pump, since a task may have become runnable.
    pub fn evaluate(&self, tally: StatusTally) {
        let published = {
            let mut state = self.state.lock();
            state.tally = tally;
            let status = Self::derive(&state.counters, &state.tally);
            if status != state.status && state.suspend_depth == 0 {
                state.status = status;
                Some(Self::snapshot_of(&state))
            } else {
                if status != state.status {
                    state.dirty = true;
                }
                None
            }
        };
        self.signal();
        if let Some(snapshot) = published {
            self.notify(&snapshot);
        }
    }

    /// Block until the gate is signaled or the manager is disposed
    pub fn wait(&self) {
        let mut gate = self.gate.lock();
        while !gate.signaled && !gate.disposed {
            self.gate_cond.wait(&mut gate);
        }
    }

    pub fn reset_wait(&self) {
        self.gate.lock().signaled = false;
    }

    /// Wake the pump without changing any counter
    pub fn signal(&self) {
        let mut gate = self.gate.lock();
        gate.signaled = true;
        self.gate_cond.notify_all();
    }

    /// Prepare for the next execution: nothing is running any more and the
    /// gate is open. Remaining and completed counts are kept.
    pub fn reset(&self) {
        let published = {
            let mut state = self.state.lock();
            if state.counters.running > 0 {
                state.counters.running = 0;
                state.dirty = true;
            }
            if state.dirty && state.suspend_depth == 0 {
                Self::recompute(&mut state)
            } else {
                None
            }
        };
        self.publish(published);
    }

    /// Release every waiter permanently and stop publishing
    pub fn dispose(&self) {
        self.state.lock().disposed = true;
        {
            let mut gate = self.gate.lock();
            gate.disposed = true;
            self.gate_cond.notify_all();
        }
        self.listeners.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn mutate(&self, change: impl FnOnce(&mut Counters)) {
        let published = {
            let mut state = self.state.lock();
            change(&mut state.counters);
            state.dirty = true;
            if state.suspend_depth > 0 {
                return;
            }
            Self::recompute(&mut state)
        };
        self.publish(published);
    }

    fn recompute(state: &mut StatusState) -> Option<StatusSnapshot> {
        state.dirty = false;
        if state.counters.remaining < state.counters.running {
            warn!(
                remaining = state.counters.remaining,
                running = state.counters.running,
                "More tasks running than remaining"
            );
        }
        state.status = Self::derive(&state.counters, &state.tally);
        (!state.disposed).then(|| Self::snapshot_of(state))
    }

    fn publish(&self, snapshot: Option<StatusSnapshot>) {
        self.signal();
        if let Some(snapshot) = snapshot {
            trace!(?snapshot, "Group status updated");
            self.notify(&snapshot);
        }
    }

    fn notify(&self, snapshot: &StatusSnapshot) {
        self.listeners.emit(snapshot);
    }

    fn derive(counters: &Counters, tally: &StatusTally) -> GroupStatus {
        if counters.running > 0 {
            GroupStatus::Running
        } else if counters.remaining > 0 {
            GroupStatus::Pending
        } else if tally.finished() == 0 {
            GroupStatus::Idle
        } else if tally.failed > 0 {
            GroupStatus::Failed
        } else if tally.succeeded == tally.finished() {
            GroupStatus::Succeeded
        } else if tally.succeeded == 0 {
            GroupStatus::Cancelled
        } else {
            GroupStatus::Completed
        }
    }

    fn snapshot_of(state: &StatusState) -> StatusSnapshot {
        StatusSnapshot {
            remaining: state.counters.remaining,
            running: state.counters.running,
            completed: state.counters.completed,
            max_running: state.max_running,
            status: state.status,
        }
    }

    fn checked_decrement(counter: &'static str, value: usize, by: usize) -> usize {
        value.checked_sub(by).unwrap_or_else(|| {
            warn!(counter, value, by, "Counter underflow clamped to zero");
            0
        })
    }
}

impl std::fmt::Debug for GroupStatusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GroupStatusManager")
            .field(&self.snapshot())
            .finish()
    }
}

/// Guard returned by [`GroupStatusManager::batch`]
#[must_use = "the batch publishes when the guard is dropped"]
pub struct UpdateBatch<'a> {
    manager: &'a GroupStatusManager,
}

impl Deref for UpdateBatch<'_> {
    type Target = GroupStatusManager;

    fn deref(&self) -> &GroupStatusManager {
        self.manager
    }
}

impl Drop for UpdateBatch<'_> {
    fn drop(&mut self) {
        self.manager.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<StatusSnapshot>>>;

    fn counting(manager: &GroupStatusManager) -> (Arc<AtomicUsize>, Seen) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            manager.subscribe(move |snapshot| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(*snapshot);
            });
        }
        (calls, seen)
    }

    #[test]
    fn test_batch_publishes_once() {
        let manager = GroupStatusManager::new(2);
        manager.add_remaining(3);
        let (calls, seen) = counting(&manager);

        {
            let batch = manager.batch();
            batch.increment_running();
            batch.decrement_running();
            batch.increment_completed();
            batch.remove_remaining(1);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snapshot = seen.lock()[0];
        assert_eq!(snapshot.remaining, 2);
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.status, GroupStatus::Pending);
    }

    #[test]
    fn test_nested_batches_publish_at_outermost() {
        let manager = GroupStatusManager::new(0);
        let (calls, _) = counting(&manager);

        manager.suspend_update();
        manager.add_remaining(1);
        manager.suspend_update();
        manager.increment_running();
        manager.update();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        manager.update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), GroupStatus::Running);
    }

    #[test]
    fn test_empty_batch_is_silent() {
        let manager = GroupStatusManager::new(1);
        let (calls, _) = counting(&manager);
        drop(manager.batch());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_free_slot_respects_limit() {
        let manager = GroupStatusManager::new(1);
        manager.add_remaining(2);
        assert!(manager.has_free_slot());
        manager.increment_running();
        assert!(!manager.has_free_slot());

        let unbounded = GroupStatusManager::new(0);
        unbounded.add_remaining(100);
        for _ in 0..100 {
            unbounded.increment_running();
        }
        assert!(unbounded.has_free_slot());
    }

    #[test]
    fn test_derived_outcomes() {
        let manager = GroupStatusManager::new(1);
        assert_eq!(manager.status(), GroupStatus::Idle);

        let all_succeeded = StatusTally {
            succeeded: 3,
            ..Default::default()
        };
        manager.evaluate(all_succeeded);
        assert_eq!(manager.status(), GroupStatus::Succeeded);

        manager.evaluate(StatusTally {
            succeeded: 2,
            failed: 1,
            ..Default::default()
        });
        assert_eq!(manager.status(), GroupStatus::Failed);

        manager.evaluate(StatusTally {
            succeeded: 2,
            cancelled: 1,
            ..Default::default()
        });
        assert_eq!(manager.status(), GroupStatus::Completed);

        manager.evaluate(StatusTally {
            cancelled: 2,
            stopped: 1,
            ..Default::default()
        });
        assert_eq!(manager.status(), GroupStatus::Cancelled);
    }

    #[test]
    fn test_evaluate_publishes_only_on_change() {
        let manager = GroupStatusManager::new(1);
        let (calls, _) = counting(&manager);
        let tally = StatusTally {
            succeeded: 1,
            ..Default::default()
        };
        manager.evaluate(tally);
        manager.evaluate(tally);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_underflow_is_clamped() {
        let manager = GroupStatusManager::new(1);
        manager.decrement_running();
        manager.remove_remaining(5);
        assert_eq!(manager.running(), 0);
        assert_eq!(manager.remaining(), 0);
    }

    #[test]
    fn test_wait_wakes_on_counter_change_and_dispose() {
        let manager = Arc::new(GroupStatusManager::new(1));
        manager.reset_wait();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait())
        };
        thread::sleep(Duration::from_millis(20));
        manager.add_remaining(1);
        waiter.join().unwrap();

        manager.reset_wait();
        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait())
        };
        thread::sleep(Duration::from_millis(20));
        manager.dispose();
        waiter.join().unwrap();

        // Disposed managers never block
        manager.reset_wait();
        manager.wait();
    }

    #[test]
    fn test_reset_clears_running_only() {
        let manager = GroupStatusManager::new(2);
        manager.add_remaining(2);
        manager.increment_running();
        manager.increment_completed();
        manager.reset();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.remaining, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.status, GroupStatus::Pending);
    }
}
