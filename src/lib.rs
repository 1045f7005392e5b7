//! # taskgroup
//!
//! Bounded-concurrency task groups. A [`TaskGroup`] drives the tasks of a
//! [`TaskCollection`], starting `Ready` tasks while fewer than a configured
//! maximum are running, and maintains aggregate counters, a derived group
//! status and an aggregate progress percentage. Task notifications reach
//! the group through an ordered, single-consumer command queue.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: tasks, the [`Job`] contract and the task collection
//! - **[`group`]**: the scheduler plus its status and progress managers
//! - **[`queue`]**: FIFO dispatch of deferred commands on a thread pool
//! - **[`sync`]**: wait handles and listener registries
//! - **[`config`]**: TOML configuration and discovery
//! - **[`cli`]**: the `taskgroup` binary's simulated transfers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskgroup::{Job, Task, TaskCollection, TaskGroup, TaskHandle, TaskStatus};
//!
//! struct Upload;
//!
//! impl Job for Upload {
//!     fn execute(&self, task: &TaskHandle) -> anyhow::Result<()> {
//!         let task = task.clone();
//!         std::thread::spawn(move || {
//!             let _ = task.set_progress(100);
//!             task.set_status(TaskStatus::Succeeded);
//!         });
//!         Ok(())
//!     }
//!
//!     fn cancel(&self, task: &TaskHandle) -> anyhow::Result<()> {
//!         task.set_status(TaskStatus::Cancelled);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let tasks = (0..4).map(|i| Task::new(format!("upload-{i}"), Upload)).collect();
//!     let group = TaskGroup::new(2, TaskCollection::from_tasks(tasks)?)?;
//!
//!     group.execute()?;
//!     group.wait_until_stopped(None);
//!     println!("{:?}", group.snapshot());
//!     Ok(())
//! }
//! ```

/// Error types shared by every component.
pub mod error;

/// Environment constants and path utilities.
///
/// Centralizes thread names, configuration paths and logging defaults.
pub mod env;

/// Tracing setup and the sink for contained failures.
pub mod logging;

pub mod sync;

/// Ordered asynchronous command dispatch.
pub mod queue;

/// Tasks, the job contract and task collections.
pub mod task;

/// Task groups and their status and progress bookkeeping.
pub mod group;

/// Configuration loading and discovery.
pub mod config;

// CLI module for command-line interface
pub mod cli;

pub use config::{AppConfig, ConfigDiscovery, ConfigError, GroupConfig};
pub use error::{Result, TaskGroupError};
pub use group::{
    GroupEvent, GroupProgressManager, GroupStatus, GroupStatusManager, StatusSnapshot, TaskGroup,
    TaskGroupBuilder,
};
pub use logging::{ExceptionLogger, TracingExceptionLogger};
pub use queue::{AsyncCommandQueue, QueueEvent};
pub use sync::{SubscriptionId, WaitHandle};
pub use task::{
    CollectionEvent, GroupId, Job, Task, TaskCollection, TaskEvent, TaskHandle, TaskId, TaskStatus,
};
