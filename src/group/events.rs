use crate::group::status::StatusSnapshot;
use crate::task::{GroupId, TaskId, TaskStatus};

/// Events raised by a task group to its subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// The pump thread started
    Started { group_id: GroupId },
    /// The pump thread is about to exit
    Stopped { group_id: GroupId },
    /// A task was promoted to running and is about to execute
    TaskStarted { group_id: GroupId, task_id: TaskId },
    /// A task reported completion
    TaskStopped {
        group_id: GroupId,
        task_id: TaskId,
        status: TaskStatus,
    },
    /// Forwarded status change of a member task
    TaskStatusChanged {
        group_id: GroupId,
        task_id: TaskId,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    /// Counters or derived status changed
    StatusChanged {
        group_id: GroupId,
        snapshot: StatusSnapshot,
    },
    /// The rounded aggregate progress changed
    ProgressChanged { group_id: GroupId, progress: u8 },
}

impl GroupEvent {
    pub fn group_id(&self) -> GroupId {
        match self {
            GroupEvent::Started { group_id }
            | GroupEvent::Stopped { group_id }
            | GroupEvent::TaskStarted { group_id, .. }
            | GroupEvent::TaskStopped { group_id, .. }
            | GroupEvent::TaskStatusChanged { group_id, .. }
            | GroupEvent::StatusChanged { group_id, .. }
            | GroupEvent::ProgressChanged { group_id, .. } => *group_id,
        }
    }
}
