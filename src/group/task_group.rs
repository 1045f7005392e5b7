use crate::config::GroupConfig;
use crate::env::threads::PUMP_THREAD_PREFIX;
use crate::error::{Result, TaskGroupError};
use crate::group::events::GroupEvent;
use crate::group::progress::GroupProgressManager;
use crate::group::status::{GroupStatus, GroupStatusManager, StatusSnapshot};
use crate::logging::{ExceptionLogger, TracingExceptionLogger, panic_to_error};
use crate::queue::AsyncCommandQueue;
use crate::sync::{Listener, Listeners, SubscriptionId, WaitHandle};
use crate::task::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Bounded-concurrency scheduler over a [`TaskCollection`].
///
/// [`execute`](Self::execute) spawns one dedicated pump thread that starts
/// `Ready` tasks while fewer than `max_running_tasks` are running, then
/// waits for counter changes. Every group event is delivered from the
/// group's [`AsyncCommandQueue`], so subscribers are notified one at a time,
/// off the pump thread, and never from inside a job's own call.
///
/// Dropping the group disposes it.
pub struct TaskGroup<J: Job> {
    inner: Arc<GroupInner<J>>,
}

struct GroupInner<J: Job> {
    id: GroupId,
    weak_self: Weak<GroupInner<J>>,
    max_running_tasks: usize,
    collection: TaskCollection<J>,
    status: Arc<GroupStatusManager>,
    progress: Arc<GroupProgressManager>,
    queue: AsyncCommandQueue,
    logger: Arc<dyn ExceptionLogger>,
    listeners: Listeners<GroupEvent>,
    state: Mutex<GroupState<J>>,
    lifecycle: Mutex<Lifecycle>,
    executing: AtomicBool,
    cancel_requested: AtomicBool,
    disposed: AtomicBool,
    execution_done: WaitHandle,
    pump_thread_name: String,
}

struct GroupState<J: Job> {
    /// Tasks promoted to running that have not reported completion
    current: Vec<Task<J>>,
    /// Tasks counted in `remaining`
    outstanding: HashSet<TaskId>,
    /// Running tasks removed from the collection, released on completion
    pending_removal: HashSet<TaskId>,
}

#[derive(Default)]
struct Lifecycle {
    pump: Option<JoinHandle<()>>,
    pump_thread: Option<ThreadId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    Stop,
}

/// Builder for [`TaskGroup`] with constructor-injected collaborators
pub struct TaskGroupBuilder<J: Job> {
    max_running_tasks: usize,
    collection: TaskCollection<J>,
    status_manager: Option<Arc<GroupStatusManager>>,
    progress_manager: Option<Arc<GroupProgressManager>>,
    logger: Option<Arc<dyn ExceptionLogger>>,
    runtime: Option<Handle>,
    pump_thread_name: String,
}

impl<J: Job> TaskGroupBuilder<J> {
    /// Use a caller-owned status manager; its limit is set to the group's
    pub fn status_manager(mut self, manager: Arc<GroupStatusManager>) -> Self {
        self.status_manager = Some(manager);
        self
    }

    /// Use a caller-owned progress manager
    pub fn progress_manager(mut self, manager: Arc<GroupProgressManager>) -> Self {
        self.progress_manager = Some(manager);
        self
    }

    /// Sink for failures raised by jobs, commands and listeners
    pub fn exception_logger(mut self, logger: Arc<dyn ExceptionLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Runtime whose blocking pool delivers the group's events
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Pump thread name prefix; the first eight hex digits of the group id
    /// are appended
    pub fn pump_thread_name(mut self, name: impl Into<String>) -> Self {
        self.pump_thread_name = name.into();
        self
    }

    /// Create the group and associate every task already in the collection.
    ///
    /// Fails without side effects on the tasks if the collection is bound to
    /// another live group or one of its tasks belongs to another group.
    pub fn build(self) -> Result<TaskGroup<J>> {
        let id = Uuid::new_v4();
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingExceptionLogger));
        let queue = match self.runtime {
            Some(runtime) => AsyncCommandQueue::with_runtime(runtime, logger.clone()),
            None => AsyncCommandQueue::with_logger(logger.clone())?,
        };
        let status = self
            .status_manager
            .unwrap_or_else(|| Arc::new(GroupStatusManager::new(self.max_running_tasks)));
        status.set_max_running(self.max_running_tasks);
        let progress = self.progress_manager.unwrap_or_default();

        let inner = Arc::new_cyclic(|weak_self| GroupInner {
            id,
            weak_self: weak_self.clone(),
            max_running_tasks: self.max_running_tasks,
            collection: self.collection,
            status,
            progress,
            queue,
            logger,
            listeners: Listeners::new(),
            state: Mutex::new(GroupState {
                current: Vec::new(),
                outstanding: HashSet::new(),
                pending_removal: HashSet::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            executing: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            execution_done: WaitHandle::signaled(),
            pump_thread_name: self.pump_thread_name,
        });

        inner.forward_manager_events();
        if let Err(e) = inner.bind_collection() {
            inner.queue.dispose();
            return Err(e);
        }

        info!(
            group = %id,
            tasks = inner.collection.len(),
            max_running = inner.max_running_tasks,
            "Task group created"
        );
        Ok(TaskGroup { inner })
    }
}

impl<J: Job> TaskGroup<J> {
    /// Create a group over `collection`; `0` means no concurrency limit
    pub fn new(max_running_tasks: usize, collection: TaskCollection<J>) -> Result<Self> {
        Self::builder(max_running_tasks, collection).build()
    }

    pub fn builder(max_running_tasks: usize, collection: TaskCollection<J>) -> TaskGroupBuilder<J> {
        TaskGroupBuilder {
            max_running_tasks,
            collection,
            status_manager: None,
            progress_manager: None,
            logger: None,
            runtime: None,
            pump_thread_name: PUMP_THREAD_PREFIX.to_string(),
        }
    }

    /// Create a group from validated configuration
    pub fn from_config(config: &GroupConfig, collection: TaskCollection<J>) -> Result<Self> {
        if config.max_running_tasks < 0 {
            return Err(TaskGroupError::InvalidConcurrency(config.max_running_tasks));
        }
        let max_running_tasks = config.validate()?;
        Self::builder(max_running_tasks, collection)
            .pump_thread_name(config.pump_thread_name.clone())
            .build()
    }

    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    pub fn max_running_tasks(&self) -> usize {
        self.inner.max_running_tasks
    }

    pub fn collection(&self) -> &TaskCollection<J> {
        &self.inner.collection
    }

    pub fn status_manager(&self) -> &Arc<GroupStatusManager> {
        &self.inner.status
    }

    pub fn progress_manager(&self) -> &Arc<GroupProgressManager> {
        &self.inner.progress
    }

    /// Tasks currently running, in start order
    pub fn current_tasks(&self) -> Vec<Task<J>> {
        self.inner.state.lock().current.clone()
    }

    pub fn remaining_tasks(&self) -> usize {
        self.inner.status.remaining()
    }

    pub fn running_tasks(&self) -> usize {
        self.inner.status.running()
    }

    pub fn completed_tasks(&self) -> usize {
        self.inner.status.completed()
    }

    pub fn status(&self) -> GroupStatus {
        self.inner.status.status()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.status.snapshot()
    }

    /// Aggregate progress percentage
    pub fn progress(&self) -> u8 {
        self.inner.progress.progress()
    }

    pub fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::SeqCst)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&GroupEvent) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .subscribe(Arc::new(listener) as Listener<GroupEvent>)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Start the pump thread. Ignored while an execution is in flight.
    pub fn execute(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if self.is_disposed() {
            return Err(TaskGroupError::Disposed("TaskGroup"));
        }
        if self.inner.executing.load(Ordering::SeqCst) {
            debug!(group = %self.inner.id, "Execute ignored: already executing");
            return Ok(());
        }

        self.inner.executing.store(true, Ordering::SeqCst);
        self.inner.cancel_requested.store(false, Ordering::SeqCst);
        self.inner.execution_done.reset();
        self.inner.status.signal();

        let name = format!(
            "{}-{}",
            self.inner.pump_thread_name,
            &self.inner.id.simple().to_string()[..8]
        );
        let inner = self.inner.clone();
        match thread::Builder::new()
            .name(name)
            .spawn(move || inner.run_pump())
        {
            Ok(pump) => {
                lifecycle.pump_thread = Some(pump.thread().id());
                lifecycle.pump = Some(pump);
                info!(group = %self.inner.id, "Task group executing");
                Ok(())
            }
            Err(e) => {
                self.inner.executing.store(false, Ordering::SeqCst);
                self.inner.execution_done.set();
                Err(TaskGroupError::Spawn(e))
            }
        }
    }

    /// Request cooperative cancellation of the running tasks.
    ///
    /// Effective once per execution. No further task is started; the pump
    /// exits after every running task has reported completion.
    pub fn cancel(&self) -> Result<()> {
        self.interrupt(Interrupt::Cancel)
    }

    /// Like [`cancel`](Self::cancel), but asks each running task to stop
    pub fn stop(&self) -> Result<()> {
        self.interrupt(Interrupt::Stop)
    }

    fn interrupt(&self, kind: Interrupt) -> Result<()> {
        if self.is_disposed() {
            return Err(TaskGroupError::Disposed("TaskGroup"));
        }
        if self.inner.cancel_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let current = {
            let _root = self.inner.collection.lock();
            self.inner.state.lock().current.clone()
        };
        info!(group = %self.inner.id, running = current.len(), ?kind, "Interrupting task group");

        for task in &current {
            self.inner.interrupt_task(task, kind);
        }
        self.inner.status.signal();
        Ok(())
    }

    /// Block until the current execution ends; `None` waits indefinitely.
    ///
    /// Returns `true` immediately when the group is not executing. The
    /// execution ends after its `Stopped` event has been delivered, so a group
    /// subscriber waiting here without a timeout never returns.
    pub fn wait_until_stopped(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => self.inner.execution_done.wait_timeout(timeout),
            None => {
                self.inner.execution_done.wait();
                true
            }
        }
    }

    /// Stop the group and release its resources. Idempotent.
    ///
    /// Blocks until the pump thread has exited and every queued event has
    /// been delivered; no group event fires after this returns.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Dispose, then signal `done`. `done` is signaled even if the group was
    /// already disposed.
    pub fn dispose_with(&self, done: &WaitHandle) {
        self.inner.dispose();
        done.set();
    }
}

impl<J: Job> Drop for TaskGroup<J> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<J: Job> std::fmt::Debug for TaskGroup<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.inner.id)
            .field("max_running_tasks", &self.inner.max_running_tasks)
            .field("snapshot", &self.snapshot())
            .field("executing", &self.is_executing())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Sets its handle when the delivery command runs or is dropped unrun
struct DeliveryGuard(WaitHandle);

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

impl<J: Job> GroupInner<J> {
    /// Notify subscribers on the calling thread. Only for the dispatch thread.
    fn emit(&self, event: GroupEvent) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.listeners.emit(&event))) {
            self.logger
                .log_exception("group listener panicked", &panic_to_error(payload));
        }
    }

    /// Queue `event` for delivery. The returned handle is set once the event
    /// has been delivered, or discarded because the queue is closed.
    fn post(&self, event: GroupEvent) -> WaitHandle {
        let delivered = WaitHandle::new();
        let guard = DeliveryGuard(delivered.clone());
        let group = self.weak_self.clone();
        let posted = self.queue.register(move || {
            let _guard = guard;
            if let Some(group) = group.upgrade() {
                group.emit(event);
            }
            Ok(())
        });
        if posted.is_err() {
            trace!(group = %self.id, "Queue closed; group event discarded");
        }
        delivered
    }

    fn forward_manager_events(&self) {
        let weak = self.weak_self.clone();
        self.status.subscribe(move |snapshot| {
            if let Some(group) = weak.upgrade() {
                group.post(GroupEvent::StatusChanged {
                    group_id: group.id,
                    snapshot: *snapshot,
                });
            }
        });

        let weak = self.weak_self.clone();
        self.progress.subscribe(move |progress| {
            if let Some(group) = weak.upgrade() {
                group.post(GroupEvent::ProgressChanged {
                    group_id: group.id,
                    progress: *progress,
                });
            }
        });
    }

    fn bind_collection(&self) -> Result<()> {
        let _root = self.collection.lock();
        let observer: Weak<dyn CollectionObserver<J>> = self.weak_self.clone();
        self.collection.bind(self.id, observer)?;

        let tasks = self.collection.snapshot();
        if let Err(e) = self.attach_tasks(&tasks) {
            self.collection.unbind(self.id);
            return Err(e);
        }
        Ok(())
    }

    fn pipeline(&self) -> EventPipeline {
        let sink: Weak<dyn TaskEventSink> = self.weak_self.clone();
        EventPipeline::new(self.queue.clone(), sink)
    }

    fn run_pump(self: Arc<Self>) {
        self.post(GroupEvent::Started { group_id: self.id });

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.pump())) {
            self.logger
                .log_exception("pump loop panicked", &panic_to_error(payload));
        }

        self.finish_execution();
    }

    fn pump(&self) {
        loop {
            self.status.wait();

            let _root = self.collection.lock();
            self.status.reset_wait();

            if self.disposed.load(Ordering::SeqCst) || self.status.remaining() == 0 {
                break;
            }
            if self.cancel_requested.load(Ordering::SeqCst) {
                if self.status.running() == 0 {
                    debug!(group = %self.id, "Cancellation drained");
                    break;
                }
                continue;
            }
            if !self.status.has_free_slot() {
                continue;
            }
            if let Some(task) = self.next_ready_task() {
                self.start_task(task);
            }
        }
    }

    /// First `Ready` task in collection order that is not already running
    fn next_ready_task(&self) -> Option<Task<J>> {
        let state = self.state.lock();
        let mut tasks = self.collection.enumerator();
        let mut found = tasks.move_first(TaskStatus::Ready);
        while found {
            let task = tasks.current()?;
            if !state.current.iter().any(|running| running.id() == task.id()) {
                return Some(task.clone());
            }
            found = tasks.move_next(TaskStatus::Ready);
        }
        None
    }

    fn start_task(&self, task: Task<J>) {
        let batch = self.status.batch();
        let promoted = {
            let _task_root = task.sync_root().lock();
            // Cancelled or removed since the scan
            let still_ready =
                task.status() == TaskStatus::Ready && self.collection.contains(task.id());
            if still_ready {
                self.state.lock().current.push(task.clone());
                batch.increment_running();
            }
            still_ready
        };
        drop(batch);

        if !promoted {
            debug!(group = %self.id, task = %task.name(), "Task no longer ready; rescanning");
            self.status.signal();
            return;
        }

        debug!(group = %self.id, task = %task.name(), "Starting task");
        self.post(GroupEvent::TaskStarted {
            group_id: self.id,
            task_id: task.id(),
        });

        let error = match catch_unwind(AssertUnwindSafe(|| task.execute())) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => panic_to_error(payload),
        };
        self.logger
            .log_exception(&format!("task '{}' failed to start", task.name()), &error);
        self.force_complete(&task);
    }

    /// Count a task whose start blew up as completed and mark it failed
    fn force_complete(&self, task: &Task<J>) {
        let batch = self.status.batch();
        let release = {
            let mut state = self.state.lock();
            if let Some(position) = state.current.iter().position(|t| t.id() == task.id()) {
                state.current.remove(position);
                batch.decrement_running();
                batch.increment_completed();
            }
            if state.outstanding.remove(&task.id()) {
                batch.remove_remaining(1);
            }
            state.pending_removal.remove(&task.id())
        };
        drop(batch);

        warn!(group = %self.id, task = %task.name(), "Task counted as completed after failing to start");
        if !task.is_completed() {
            task.set_status(TaskStatus::Failed);
        }
        if release {
            task.detach();
            self.progress.remove(task.id());
        }
    }

    fn interrupt_task(&self, task: &Task<J>, kind: Interrupt) {
        let _task_root = task.sync_root().lock();
        let outcome = catch_unwind(AssertUnwindSafe(|| match kind {
            Interrupt::Cancel => task.cancel(),
            Interrupt::Stop => task.stop(),
        }));
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => panic_to_error(payload),
        };
        self.logger.log_exception(
            &format!("task '{}' rejected {:?}", task.name(), kind),
            &error,
        );
    }

    fn on_task_completed(&self, task: &TaskHandle, status: TaskStatus) {
        {
            let _root = self.collection.lock();
            let batch = self.status.batch();
            let release = {
                let mut state = self.state.lock();
                if let Some(position) = state.current.iter().position(|t| t.id() == task.id()) {
                    state.current.remove(position);
                    batch.decrement_running();
                    if status != TaskStatus::Cancelled {
                        batch.increment_completed();
                    }
                }
                if state.outstanding.remove(&task.id()) {
                    batch.remove_remaining(1);
                }
                state.pending_removal.remove(&task.id())
            };
            if release {
                task.detach();
                self.progress.remove(task.id());
            }
        }

        debug!(group = %self.id, task = %task.name(), %status, "Task completed");
        self.emit(GroupEvent::TaskStopped {
            group_id: self.id,
            task_id: task.id(),
            status,
        });
    }

    fn on_task_status_changed(
        &self,
        task: &TaskHandle,
        old_status: TaskStatus,
        new_status: TaskStatus,
    ) {
        self.emit(GroupEvent::TaskStatusChanged {
            group_id: self.id,
            task_id: task.id(),
            old_status,
            new_status,
        });

        let _root = self.collection.lock();
        let batch = self.status.batch();
        // A finished task made runnable again counts as outstanding
        if old_status.is_completed()
            && !new_status.is_completed()
            && self.collection.contains(task.id())
            && self.state.lock().outstanding.insert(task.id())
        {
            batch.add_remaining(1);
        }
        batch.evaluate(self.collection.tally());
    }

    fn finish_execution(&self) {
        // Waiters on `execution_done` observe the delivered `Stopped`
        self.post(GroupEvent::Stopped { group_id: self.id }).wait();

        {
            let _root = self.collection.lock();
            self.status.reset();
            self.progress.reset();
        }

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.pump_thread = None;
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.executing.store(false, Ordering::SeqCst);
        self.execution_done.set();
        info!(group = %self.id, "Task group stopped");
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(group = %self.id, "Disposing task group");

        // Wake the pump so it observes the disposed flag
        self.status.signal();
        let on_pump = self.lifecycle.lock().pump_thread == Some(thread::current().id());
        let pump = if on_pump {
            None
        } else {
            self.lifecycle.lock().pump.take()
        };
        if let Some(pump) = pump {
            if self.queue.is_dispatch_thread() {
                debug!(group = %self.id, "Disposed from dispatch thread; pump not joined");
            } else if pump.join().is_err() {
                warn!(group = %self.id, "Pump thread panicked");
            }
        }

        self.collection.unbind(self.id);
        if on_pump {
            // Queued commands wait on the group lock this thread may hold
            self.queue.close();
        } else {
            self.queue.dispose();
        }

        {
            let _root = self.collection.lock();
            let mut state = self.state.lock();
            for task in self.collection.snapshot() {
                task.detach();
            }
            for task in state.current.drain(..) {
                task.detach();
            }
            state.outstanding.clear();
            state.pending_removal.clear();
        }

        self.status.dispose();
        self.progress.dispose();
        self.listeners.clear();
        info!(group = %self.id, "Task group disposed");
    }
}

impl<J: Job> CollectionObserver<J> for GroupInner<J> {
    fn attach_tasks(&self, tasks: &[Task<J>]) -> Result<()> {
        for task in tasks {
            task.ensure_attachable(self.id)?;
        }

        let pipeline = self.pipeline();
        let batch = self.status.batch();
        {
            let mut state = self.state.lock();
            let mut outstanding = 0;
            for task in tasks {
                task.attach(self.id, pipeline.clone())?;
                if !task.is_completed() && state.outstanding.insert(task.id()) {
                    outstanding += 1;
                }
            }
            batch.add_remaining(outstanding);
        }

        let mut tally = self.collection.tally();
        for task in tasks {
            tally.record(task.status());
        }
        batch.evaluate(tally);
        drop(batch);

        self.progress
            .add_range(tasks.iter().map(|task| (task.id(), task.progress())));
        debug!(group = %self.id, attached = tasks.len(), "Tasks attached");
        Ok(())
    }

    fn detach_tasks(&self, tasks: &[Task<J>]) {
        let batch = self.status.batch();
        let (running, released) = {
            let mut state = self.state.lock();
            let mut running = Vec::new();
            let mut released = Vec::new();
            for task in tasks {
                if state.current.iter().any(|t| t.id() == task.id()) {
                    state.pending_removal.insert(task.id());
                    running.push(task.clone());
                } else {
                    if state.outstanding.remove(&task.id()) {
                        batch.remove_remaining(1);
                    }
                    released.push(task.clone());
                }
            }
            (running, released)
        };

        for task in &released {
            task.detach();
        }
        batch.evaluate(self.collection.tally());
        drop(batch);
        self.progress
            .remove_range(released.iter().map(|task| task.id()));

        // Running tasks leave once their completion arrives
        for task in &running {
            debug!(group = %self.id, task = %task.name(), "Cancelling removed running task");
            self.interrupt_task(task, Interrupt::Cancel);
        }
    }
}

impl<J: Job> TaskEventSink for GroupInner<J> {
    fn on_task_event(&self, task: &TaskHandle, event: &TaskEvent) {
        match *event {
            TaskEvent::StatusChanged {
                old_status,
                new_status,
                ..
            } => self.on_task_status_changed(task, old_status, new_status),
            TaskEvent::ProgressChanged { progress, .. } => {
                self.progress.update(task.id(), progress);
            }
            TaskEvent::Completed { status, .. } => self.on_task_completed(task, status),
        }
    }
}
