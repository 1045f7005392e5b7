use crate::error::{Result, TaskGroupError};
use crate::sync::{Listener, Listeners, SubscriptionId};
use crate::task::handle::{Job, Task};
use crate::task::types::*;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Notifications raised after the collection changed
pub enum CollectionEvent<J: Job> {
    TaskAdded(Vec<Task<J>>),
    TaskRemoved(Vec<Task<J>>),
}

impl<J: Job> CollectionEvent<J> {
    pub fn tasks(&self) -> &[Task<J>] {
        match self {
            CollectionEvent::TaskAdded(tasks) | CollectionEvent::TaskRemoved(tasks) => tasks,
        }
    }
}

/// Group-side hooks, invoked under the collection's sync root.
///
/// `attach_tasks` runs before the tasks become visible and may veto the
/// insertion; `detach_tasks` runs after they were taken out.
pub(crate) trait CollectionObserver<J: Job>: Send + Sync {
    fn attach_tasks(&self, tasks: &[Task<J>]) -> Result<()>;
    fn detach_tasks(&self, tasks: &[Task<J>]);
}

struct Binding<J: Job> {
    group_id: GroupId,
    observer: Weak<dyn CollectionObserver<J>>,
}

struct CollectionInner<J: Job> {
    sync_root: ReentrantMutex<()>,
    tasks: Mutex<Vec<Task<J>>>,
    binding: Mutex<Option<Binding<J>>>,
    listeners: Listeners<CollectionEvent<J>>,
}

/// Thread-safe, insertion-ordered set of tasks.
///
/// Clones share the same collection. Every mutation happens under the
/// reentrant [`sync_root`](Self::sync_root), which the group driving the
/// collection also uses as its own lock.
pub struct TaskCollection<J: Job> {
    inner: Arc<CollectionInner<J>>,
}

impl<J: Job> TaskCollection<J> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                sync_root: ReentrantMutex::new(()),
                tasks: Mutex::new(Vec::new()),
                binding: Mutex::new(None),
                listeners: Listeners::new(),
            }),
        }
    }

    /// Create a collection holding `tasks`
    pub fn from_tasks(tasks: Vec<Task<J>>) -> Result<Self> {
        let collection = Self::new();
        collection.add_range(tasks)?;
        Ok(collection)
    }

    /// Shared monitor guarding compound operations on the collection
    pub fn sync_root(&self) -> &ReentrantMutex<()> {
        &self.inner.sync_root
    }

    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.sync_root.lock()
    }

    pub fn add(&self, task: Task<J>) -> Result<()> {
        self.add_range(vec![task])
    }

    /// Add several tasks atomically: either all are added or none is
    pub fn add_range(&self, tasks: Vec<Task<J>>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let _root = self.lock();

        {
            let existing = self.inner.tasks.lock();
            let mut seen: HashSet<TaskId> = existing.iter().map(|task| task.id()).collect();
            if let Some(duplicate) = tasks.iter().find(|task| !seen.insert(task.id())) {
                return Err(TaskGroupError::DuplicateTask(duplicate.id()));
            }
        }

        if let Some(observer) = self.observer() {
            observer.attach_tasks(&tasks)?;
        }

        self.inner.tasks.lock().extend(tasks.iter().cloned());
        debug!(added = tasks.len(), "Tasks added to collection");
        self.inner.listeners.emit(&CollectionEvent::TaskAdded(tasks));
        Ok(())
    }

    pub fn remove(&self, task_id: TaskId) -> Option<Task<J>> {
        self.remove_range(&[task_id]).pop()
    }

    /// Remove every listed task that is present; returns the removed tasks
    pub fn remove_range(&self, task_ids: &[TaskId]) -> Vec<Task<J>> {
        let _root = self.lock();
        let removed: Vec<Task<J>> = {
            let mut tasks = self.inner.tasks.lock();
            let (removed, kept): (Vec<Task<J>>, Vec<Task<J>>) = tasks
                .drain(..)
                .partition(|task| task_ids.contains(&task.id()));
            *tasks = kept;
            removed
        };
        self.after_remove(removed)
    }

    /// Remove every task
    pub fn clear(&self) -> Vec<Task<J>> {
        let _root = self.lock();
        let removed = std::mem::take(&mut *self.inner.tasks.lock());
        self.after_remove(removed)
    }

    fn after_remove(&self, removed: Vec<Task<J>>) -> Vec<Task<J>> {
        if removed.is_empty() {
            return removed;
        }
        if let Some(observer) = self.observer() {
            observer.detach_tasks(&removed);
        }
        debug!(removed = removed.len(), "Tasks removed from collection");
        self.inner
            .listeners
            .emit(&CollectionEvent::TaskRemoved(removed.clone()));
        removed
    }

    pub fn get(&self, task_id: TaskId) -> Option<Task<J>> {
        self.inner
            .tasks
            .lock()
            .iter()
            .find(|task| task.id() == task_id)
            .cloned()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.inner
            .tasks
            .lock()
            .iter()
            .any(|task| task.id() == task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks in insertion order
    pub fn snapshot(&self) -> Vec<Task<J>> {
        self.inner.tasks.lock().clone()
    }

    /// Status counts over the current tasks
    pub fn tally(&self) -> StatusTally {
        self.inner
            .tasks
            .lock()
            .iter()
            .map(|task| task.status())
            .collect()
    }

    /// Enumerator over a snapshot of the tasks, in insertion order
    pub fn enumerator(&self) -> TaskEnumerator<J> {
        TaskEnumerator {
            tasks: self.snapshot(),
            position: None,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CollectionEvent<J>) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .subscribe(Arc::new(listener) as Listener<CollectionEvent<J>>)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Group currently bound to this collection, if it is still alive
    pub fn bound_group(&self) -> Option<GroupId> {
        self.inner
            .binding
            .lock()
            .as_ref()
            .filter(|binding| binding.observer.strong_count() > 0)
            .map(|binding| binding.group_id)
    }

    pub(crate) fn bind(
        &self,
        group_id: GroupId,
        observer: Weak<dyn CollectionObserver<J>>,
    ) -> Result<()> {
        let mut binding = self.inner.binding.lock();
        if let Some(existing) = binding.as_ref()
            && existing.observer.strong_count() > 0
        {
            return Err(TaskGroupError::CollectionInUse(existing.group_id));
        }
        *binding = Some(Binding { group_id, observer });
        Ok(())
    }

    pub(crate) fn unbind(&self, group_id: GroupId) {
        let mut binding = self.inner.binding.lock();
        if binding
            .as_ref()
            .is_some_and(|existing| existing.group_id == group_id)
        {
            *binding = None;
        }
    }

    fn observer(&self) -> Option<Arc<dyn CollectionObserver<J>>> {
        self.inner
            .binding
            .lock()
            .as_ref()
            .and_then(|binding| binding.observer.upgrade())
    }
}

impl<J: Job> Default for TaskCollection<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Job> Clone for TaskCollection<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<J: Job> std::fmt::Debug for TaskCollection<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCollection")
            .field("len", &self.len())
            .field("bound_group", &self.bound_group())
            .finish()
    }
}

/// Cursor over a collection snapshot that skips to tasks in a given status
pub struct TaskEnumerator<J: Job> {
    tasks: Vec<Task<J>>,
    position: Option<usize>,
}

impl<J: Job> TaskEnumerator<J> {
    /// Position on the first task currently in `status`
    pub fn move_first(&mut self, status: TaskStatus) -> bool {
        self.position = None;
        self.move_next(status)
    }

    /// Advance to the next task currently in `status`
    pub fn move_next(&mut self, status: TaskStatus) -> bool {
        let start = self.position.map_or(0, |position| position + 1);
        match self.tasks[start.min(self.tasks.len())..]
            .iter()
            .position(|task| task.status() == status)
        {
            Some(offset) => {
                self.position = Some(start + offset);
                true
            }
            None => {
                self.position = Some(self.tasks.len());
                false
            }
        }
    }

    pub fn current(&self) -> Option<&Task<J>> {
        self.position.and_then(|position| self.tasks.get(position))
    }
}
