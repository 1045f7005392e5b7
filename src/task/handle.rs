use crate::error::{Result, TaskGroupError};
use crate::queue::{AsyncCommandQueue, Command};
use crate::sync::{Listener, Listeners, SubscriptionId};
use crate::task::types::*;
use parking_lot::Mutex;
use std::any::Any;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};
use uuid::Uuid;

/// Work supplied by a collaborator (a file transfer, a device sync, ...).
///
/// `execute` starts the work and must return promptly; the job later reports
/// through the [`TaskHandle`] by calling [`TaskHandle::set_progress`] and
/// finally [`TaskHandle::set_status`] with a terminal status. `cancel`
/// requests cooperative cancellation; the job acknowledges it by moving the
/// task to [`TaskStatus::Cancelled`] when it is ready to.
pub trait Job: Send + Sync + 'static {
    fn execute(&self, task: &TaskHandle) -> anyhow::Result<()>;

    fn cancel(&self, task: &TaskHandle) -> anyhow::Result<()>;

    fn stop(&self, task: &TaskHandle) -> anyhow::Result<()> {
        self.cancel(task)
    }

    fn pause(&self, task: &TaskHandle) -> anyhow::Result<()> {
        Err(TaskGroupError::Unsupported {
            task: task.name().to_string(),
            operation: "pause",
        }
        .into())
    }

    fn resume(&self, task: &TaskHandle) -> anyhow::Result<()> {
        Err(TaskGroupError::Unsupported {
            task: task.name().to_string(),
            operation: "resume",
        }
        .into())
    }
}

/// Receiver of task events on the group side of a pipeline
pub(crate) trait TaskEventSink: Send + Sync {
    fn on_task_event(&self, task: &TaskHandle, event: &TaskEvent);
}

/// Typed event channel from a task into its group.
///
/// Events are posted to the group's command queue; the sink is held weakly
/// so a task never keeps its group alive.
#[derive(Clone)]
pub(crate) struct EventPipeline {
    queue: AsyncCommandQueue,
    sink: Weak<dyn TaskEventSink>,
}

impl EventPipeline {
    pub(crate) fn new(queue: AsyncCommandQueue, sink: Weak<dyn TaskEventSink>) -> Self {
        Self { queue, sink }
    }

    /// Post each event as its own command so a failing listener only loses
    /// the delivery of that one event.
    fn post(&self, task: &TaskHandle, events: Vec<TaskEvent>) -> Result<()> {
        let commands = events.into_iter().map(|event| {
            let task = task.clone();
            let sink = self.sink.clone();
            Box::new(move || {
                if let Some(sink) = sink.upgrade() {
                    sink.on_task_event(&task, &event);
                }
                task.core.listeners.emit(&event);
                Ok(())
            }) as Command
        });
        self.queue.register_all(commands)
    }
}

struct TaskState {
    status: TaskStatus,
    progress: u8,
    /// Group the task belongs to for its whole lifetime, once associated
    owner: Option<GroupId>,
    /// Present while the task is attached to its owner
    pipeline: Option<EventPipeline>,
}

struct TaskCore {
    id: TaskId,
    name: String,
    state: Mutex<TaskState>,
    sync_root: Mutex<()>,
    listeners: Listeners<TaskEvent>,
    user_state: Option<Arc<dyn Any + Send + Sync>>,
}

/// Shared, job-independent view of a task.
///
/// Handed to the job on every call; cheap to clone.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    fn new(name: String, user_state: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            core: Arc::new(TaskCore {
                id: Uuid::new_v4(),
                name,
                state: Mutex::new(TaskState {
                    status: TaskStatus::Ready,
                    progress: 0,
                    owner: None,
                    pipeline: None,
                }),
                sync_root: Mutex::new(()),
                listeners: Listeners::new(),
                user_state,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn status(&self) -> TaskStatus {
        self.core.state.lock().status
    }

    pub fn progress(&self) -> u8 {
        self.core.state.lock().progress
    }

    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    /// Group currently driving this task, if attached
    pub fn group_id(&self) -> Option<GroupId> {
        let state = self.core.state.lock();
        state.pipeline.as_ref().and(state.owner)
    }

    /// Caller-supplied state, if it has type `T`
    pub fn user_state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.core
            .user_state
            .clone()
            .and_then(|state| state.downcast::<T>().ok())
    }

    /// Per-task lock arbitrating promotion to running against concurrent
    /// cancellation or removal.
    pub fn sync_root(&self) -> &Mutex<()> {
        &self.core.sync_root
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.core
            .listeners
            .subscribe(Arc::new(listener) as Listener<TaskEvent>)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.listeners.unsubscribe(id)
    }

    /// Change the status; a no-op if it is unchanged.
    ///
    /// Entering a terminal status from a non-terminal one also raises
    /// [`TaskEvent::Completed`].
    pub fn set_status(&self, new_status: TaskStatus) {
        let (old_status, pipeline) = {
            let mut state = self.core.state.lock();
            if state.status == new_status {
                return;
            }
            let old_status = state.status;
            state.status = new_status;
            (old_status, state.pipeline.clone())
        };

        trace!(task = %self.core.name, %old_status, %new_status, "Task status changed");

        let mut events = vec![TaskEvent::StatusChanged {
            task_id: self.core.id,
            old_status,
            new_status,
        }];
        if new_status.is_completed() && !old_status.is_completed() {
            events.push(TaskEvent::Completed {
                task_id: self.core.id,
                status: new_status,
            });
        }
        self.dispatch(pipeline, events);
    }

    /// Change the progress percentage.
    ///
    /// Values outside `0..=100` are rejected without raising any event.
    pub fn set_progress(&self, value: i64) -> Result<()> {
        let progress = u8::try_from(value)
            .ok()
            .filter(|progress| *progress <= 100)
            .ok_or(TaskGroupError::ProgressOutOfRange { value })?;

        let pipeline = {
            let mut state = self.core.state.lock();
            if state.progress == progress {
                return Ok(());
            }
            state.progress = progress;
            state.pipeline.clone()
        };

        self.dispatch(
            pipeline,
            vec![TaskEvent::ProgressChanged {
                task_id: self.core.id,
                progress,
            }],
        );
        Ok(())
    }

    fn dispatch(&self, pipeline: Option<EventPipeline>, events: Vec<TaskEvent>) {
        if let Some(pipeline) = pipeline {
            match pipeline.post(self, events.clone()) {
                Ok(()) => return,
                // The group is going away; fall back to direct delivery
                Err(e) => debug!(task = %self.core.name, "Event pipeline closed: {}", e),
            }
        }
        for event in &events {
            self.core.listeners.emit(event);
        }
    }

    /// Attach the task to `group_id`, routing its events through `pipeline`
    pub(crate) fn attach(&self, group_id: GroupId, pipeline: EventPipeline) -> Result<()> {
        let mut state = self.core.state.lock();
        Self::check_owner(&state, self.core.id, group_id)?;
        state.owner = Some(group_id);
        state.pipeline = Some(pipeline);
        Ok(())
    }

    /// Fails if the task belongs to, or is attached to, a group other than
    /// `group_id`, or is already attached to `group_id`.
    pub(crate) fn ensure_attachable(&self, group_id: GroupId) -> Result<()> {
        let state = self.core.state.lock();
        Self::check_owner(&state, self.core.id, group_id)
    }

    fn check_owner(state: &TaskState, task_id: TaskId, group_id: GroupId) -> Result<()> {
        match state.owner {
            Some(owner) if owner != group_id || state.pipeline.is_some() => {
                Err(TaskGroupError::AlreadyAssociated {
                    task_id,
                    group_id: owner,
                })
            }
            _ => Ok(()),
        }
    }

    /// Stop routing events to the group; the ownership record is kept
    pub(crate) fn detach(&self) {
        self.core.state.lock().pipeline = None;
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for TaskHandle {}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("status", &state.status)
            .field("progress", &state.progress)
            .field("owner", &state.owner)
            .field("attached", &state.pipeline.is_some())
            .finish()
    }
}

/// A task: shared state plus the job that performs it.
///
/// Dereferences to [`TaskHandle`] for status, progress and events.
pub struct Task<J: Job> {
    handle: TaskHandle,
    job: Arc<J>,
}

impl<J: Job> Task<J> {
    pub fn new(name: impl Into<String>, job: J) -> Self {
        Self {
            handle: TaskHandle::new(name.into(), None),
            job: Arc::new(job),
        }
    }

    /// Create a task carrying opaque caller state
    pub fn with_user_state<S>(name: impl Into<String>, job: J, user_state: S) -> Self
    where
        S: Any + Send + Sync,
    {
        Self {
            handle: TaskHandle::new(name.into(), Some(Arc::new(user_state))),
            job: Arc::new(job),
        }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    /// Start the work; returns once the job has been kicked off
    pub fn execute(&self) -> anyhow::Result<()> {
        self.job.execute(&self.handle)
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) -> anyhow::Result<()> {
        self.job.cancel(&self.handle)
    }

    pub fn stop(&self) -> anyhow::Result<()> {
        self.job.stop(&self.handle)
    }

    pub fn pause(&self) -> anyhow::Result<()> {
        self.job.pause(&self.handle)
    }

    pub fn resume(&self) -> anyhow::Result<()> {
        self.job.resume(&self.handle)
    }
}

impl<J: Job> Clone for Task<J> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            job: self.job.clone(),
        }
    }
}

impl<J: Job> Deref for Task<J> {
    type Target = TaskHandle;

    fn deref(&self) -> &TaskHandle {
        &self.handle
    }
}

impl<J: Job> std::fmt::Debug for Task<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}
