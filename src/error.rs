use crate::config::ConfigError;
use crate::task::{GroupId, TaskId};

/// Errors raised synchronously by the task-group engine.
///
/// Failures inside scheduled work (a job's `execute`, a queued command) are
/// never returned through this type; they are reported to the configured
/// [`ExceptionLogger`](crate::logging::ExceptionLogger) instead.
#[derive(Debug, thiserror::Error)]
pub enum TaskGroupError {
    /// Progress values must lie in `0..=100`
    #[error("Progress {value} is out of range (expected 0..=100)")]
    ProgressOutOfRange { value: i64 },

    /// A negative concurrency limit was supplied
    #[error("Maximum running tasks must not be negative: {0}")]
    InvalidConcurrency(i64),

    /// The task already belongs to another group
    #[error("Task {task_id} is already associated with group {group_id}")]
    AlreadyAssociated { task_id: TaskId, group_id: GroupId },

    /// The collection already holds a task with this id
    #[error("Task {0} is already in the collection")]
    DuplicateTask(TaskId),

    /// The collection is already driven by a live group
    #[error("Collection is already bound to group {0}")]
    CollectionInUse(GroupId),

    /// The component was disposed before the call
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// The job does not implement an optional capability
    #[error("Task {task} does not support {operation}")]
    Unsupported {
        task: String,
        operation: &'static str,
    },

    /// The dedicated pump thread could not be started
    #[error("Failed to spawn pump thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The fallback dispatch runtime could not be built
    #[error("Failed to start dispatch runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, TaskGroupError>;
