use crate::sync::{Listener, Listeners, SubscriptionId};
use crate::task::TaskId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct ProgressState {
    entries: HashMap<TaskId, u8>,
    /// Aggregate last published to listeners
    reported: Option<u8>,
    disposed: bool,
}

/// Aggregates per-task progress into one group percentage.
///
/// The aggregate is the rounded mean over the tracked tasks, `0` when none
/// is tracked. Listeners hear about it only when the rounded value moves.
#[derive(Default)]
pub struct GroupProgressManager {
    state: Mutex<ProgressState>,
    listeners: Listeners<u8>,
}

impl GroupProgressManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current aggregate percentage
    pub fn progress(&self) -> u8 {
        Self::mean(&self.state.lock().entries)
    }

    /// Number of tracked tasks
    pub fn tracked(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn get(&self, task_id: TaskId) -> Option<u8> {
        self.state.lock().entries.get(&task_id).copied()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&u8) + Send + Sync + 'static,
    {
        self.listeners.subscribe(Arc::new(listener) as Listener<u8>)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn add(&self, task_id: TaskId, progress: u8) -> Option<u8> {
        self.add_range([(task_id, progress)])
    }

    pub fn add_range<I>(&self, entries: I) -> Option<u8>
    where
        I: IntoIterator<Item = (TaskId, u8)>,
    {
        self.change(|state| {
            for (task_id, progress) in entries {
                state.entries.insert(task_id, progress.min(100));
            }
            true
        })
    }

    pub fn remove(&self, task_id: TaskId) -> Option<u8> {
        self.remove_range([task_id])
    }

    pub fn remove_range<I>(&self, task_ids: I) -> Option<u8>
    where
        I: IntoIterator<Item = TaskId>,
    {
        self.change(|state| {
            for task_id in task_ids {
                state.entries.remove(&task_id);
            }
            true
        })
    }

    /// Record a new value for a tracked task.
    ///
    /// Returns the new aggregate if it was published; updates for untracked
    /// tasks are ignored.
    pub fn update(&self, task_id: TaskId, progress: u8) -> Option<u8> {
        self.change(|state| match state.entries.get_mut(&task_id) {
            Some(entry) => {
                *entry = progress.min(100);
                true
            }
            None => false,
        })
    }

    /// Forget the last published aggregate so the next change is reported
    pub fn reset(&self) {
        self.state.lock().reported = None;
    }

    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.entries.clear();
        drop(state);
        self.listeners.clear();
    }

    fn change(&self, apply: impl FnOnce(&mut ProgressState) -> bool) -> Option<u8> {
        let published = {
            let mut state = self.state.lock();
            if state.disposed || !apply(&mut state) {
                return None;
            }
            let aggregate = Self::mean(&state.entries);
            if state.reported == Some(aggregate) {
                None
            } else {
                state.reported = Some(aggregate);
                Some(aggregate)
            }
        };
        if let Some(aggregate) = published {
            self.listeners.emit(&aggregate);
        }
        published
    }

    fn mean(entries: &HashMap<TaskId, u8>) -> u8 {
        if entries.is_empty() {
            return 0;
        }
        let count = entries.len() as u64;
        let sum: u64 = entries.values().map(|progress| u64::from(*progress)).sum();
        // Round half up; the mean of values <= 100 always fits in a u8
        ((sum * 2 + count) / (count * 2)) as u8
    }
}

impl std::fmt::Debug for GroupProgressManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupProgressManager")
            .field("tracked", &self.tracked())
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn recorded(manager: &GroupProgressManager) -> Arc<Mutex<Vec<u8>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.subscribe(move |progress| sink.lock().push(*progress));
        seen
    }

    #[test]
    fn test_mean_is_rounded() {
        let manager = GroupProgressManager::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        manager.add_range([(a, 0), (b, 0), (c, 0)]);

        manager.update(a, 50);
        // 50 / 3 = 16.67
        assert_eq!(manager.progress(), 17);
        manager.update(b, 100);
        manager.update(c, 100);
        assert_eq!(manager.progress(), 83);

        let empty = GroupProgressManager::new();
        assert_eq!(empty.progress(), 0);
    }

    #[test]
    fn test_unchanged_aggregate_is_not_republished() {
        let manager = GroupProgressManager::new();
        let ids: Vec<TaskId> = (0..4).map(|_| Uuid::new_v4()).collect();
        manager.add_range(ids.iter().map(|id| (*id, 0)));
        let seen = recorded(&manager);

        // 1/4 rounds to 0: no event
        manager.update(ids[0], 1);
        assert!(seen.lock().is_empty());

        manager.update(ids[0], 40);
        manager.update(ids[0], 40);
        assert_eq!(*seen.lock(), vec![10]);
    }

    #[test]
    fn test_membership_changes_move_aggregate() {
        let manager = GroupProgressManager::new();
        let (done, idle) = (Uuid::new_v4(), Uuid::new_v4());
        manager.add(done, 100);
        assert_eq!(manager.add(idle, 0), Some(50));
        assert_eq!(manager.remove(idle), Some(100));
        assert_eq!(manager.tracked(), 1);
    }

    #[test]
    fn test_untracked_updates_are_ignored() {
        let manager = GroupProgressManager::new();
        let seen = recorded(&manager);
        assert_eq!(manager.update(Uuid::new_v4(), 70), None);
        assert_eq!(manager.progress(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_reset_republishes_and_dispose_silences() {
        let manager = GroupProgressManager::new();
        let id = Uuid::new_v4();
        manager.add(id, 30);
        manager.reset();
        assert_eq!(manager.update(id, 30), Some(30));

        manager.dispose();
        assert_eq!(manager.add(Uuid::new_v4(), 90), None);
        assert_eq!(manager.tracked(), 0);
    }
}
