use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Unique identifier for task groups
pub type GroupId = Uuid;

/// Task status.
///
/// A task being executed by a group keeps its own status (usually `Ready`)
/// while running; the group tracks the running condition separately.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Task can be started
    Ready,
    /// Task was suspended by its job and must return to `Ready` to continue
    Paused,
    /// Task ended because cancellation was requested
    Cancelled,
    /// Task ended with an error
    Failed,
    /// Task finished its work
    Succeeded,
    /// Task was stopped before finishing
    Stopped,
}

impl TaskStatus {
    /// Whether the status is terminal
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled | TaskStatus::Failed | TaskStatus::Succeeded | TaskStatus::Stopped
        )
    }

    /// Whether a group may start a task in this status
    pub fn is_runnable(self) -> bool {
        self == TaskStatus::Ready
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Stopped => "stopped",
        };
        f.pad(name)
    }
}

/// Events raised by a single task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    StatusChanged {
        task_id: TaskId,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    ProgressChanged {
        task_id: TaskId,
        progress: u8,
    },
    /// The task entered a terminal status
    Completed {
        task_id: TaskId,
        status: TaskStatus,
    },
}

/// Count of tasks per status, used to derive the aggregate group status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusTally {
    pub ready: usize,
    pub paused: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub succeeded: usize,
    pub stopped: usize,
}

impl StatusTally {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::Paused => self.paused += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Stopped => self.stopped += 1,
        }
    }

    /// Tasks in a terminal status
    pub fn finished(&self) -> usize {
        self.cancelled + self.failed + self.succeeded + self.stopped
    }

    pub fn total(&self) -> usize {
        self.finished() + self.ready + self.paused
    }
}

impl FromIterator<TaskStatus> for StatusTally {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut tally = StatusTally::default();
        for status in iter {
            tally.record(status);
        }
        tally
    }
}
