//! Simulated transfers driven by a task group
//!
//! Each transfer is a tokio task that advances its progress in fixed steps,
//! honours cancellation between steps and may fail at a random step.

use crate::config::{AppConfig, SimulationConfig};
use crate::group::{GroupEvent, GroupStatus, StatusSnapshot, TaskGroup};
use crate::task::{GroupId, Job, Task, TaskCollection, TaskHandle, TaskStatus};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const RUNNING: u8 = 0;
const CANCEL: u8 = 1;
const STOP: u8 = 2;

/// Job that pretends to move a file in `steps` increments
pub struct SimulatedTransfer {
    runtime: Handle,
    steps: u32,
    step: Duration,
    /// Step at which the transfer fails, if it is doomed to
    fail_at: Option<u32>,
    interrupt: Arc<AtomicU8>,
}

impl SimulatedTransfer {
    pub fn new(runtime: Handle, settings: &SimulationConfig) -> Self {
        let mut rng = rand::rng();
        let steps = settings.steps.max(1);
        let fail_at = rng
            .random_bool(settings.failure_rate.clamp(0.0, 1.0))
            .then(|| rng.random_range(1..=steps));

        Self {
            runtime,
            steps,
            step: Duration::from_millis(settings.step_ms),
            fail_at,
            interrupt: Arc::new(AtomicU8::new(RUNNING)),
        }
    }

    pub fn will_fail(&self) -> bool {
        self.fail_at.is_some()
    }
}

impl Job for SimulatedTransfer {
    fn execute(&self, task: &TaskHandle) -> anyhow::Result<()> {
        self.interrupt.store(RUNNING, Ordering::SeqCst);

        let task = task.clone();
        let interrupt = self.interrupt.clone();
        let (steps, step, fail_at) = (self.steps, self.step, self.fail_at);

        self.runtime.spawn(async move {
            for current in 1..=steps {
                tokio::time::sleep(step).await;

                match interrupt.load(Ordering::SeqCst) {
                    CANCEL => return task.set_status(TaskStatus::Cancelled),
                    STOP => return task.set_status(TaskStatus::Stopped),
                    _ => {}
                }
                if fail_at == Some(current) {
                    warn!(task = %task.name(), step = current, "Transfer failed");
                    return task.set_status(TaskStatus::Failed);
                }

                let progress = i64::from(current) * 100 / i64::from(steps);
                if let Err(e) = task.set_progress(progress) {
                    warn!(task = %task.name(), "Dropping progress update: {}", e);
                }
            }
            task.set_status(TaskStatus::Succeeded);
        });
        Ok(())
    }

    fn cancel(&self, _task: &TaskHandle) -> anyhow::Result<()> {
        self.interrupt.store(CANCEL, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, _task: &TaskHandle) -> anyhow::Result<()> {
        self.interrupt.store(STOP, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub status: TaskStatus,
    pub progress: u8,
}

/// Outcome of one simulated run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub group_id: GroupId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub cancelled: bool,
    pub progress: u8,
    pub snapshot: StatusSnapshot,
    pub tasks: Vec<TaskSummary>,
}

impl RunSummary {
    pub fn status(&self) -> GroupStatus {
        self.snapshot.status
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }

    /// Human-readable report
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Group {} finished: {:?}", self.group_id, self.status());
        let _ = writeln!(
            out,
            "  started {}  finished {}  ({} ms)",
            self.started_at.format("%H:%M:%S%.3f"),
            self.finished_at.format("%H:%M:%S%.3f"),
            self.elapsed_ms
        );
        let _ = writeln!(
            out,
            "  completed {}  remaining {}  progress {}%{}",
            self.snapshot.completed,
            self.snapshot.remaining,
            self.progress,
            if self.cancelled { "  (cancelled)" } else { "" }
        );
        for task in &self.tasks {
            let _ = writeln!(out, "  {:<14} {:<10} {:>3}%", task.name, task.status, task.progress);
        }
        out
    }
}

/// Run one group of simulated transfers to completion.
///
/// Blocks the calling thread; call it from a blocking context when inside
/// an async runtime. `runtime` drives the transfers themselves.
pub fn run_simulation(
    config: &AppConfig,
    runtime: Handle,
    cancel_after: Option<Duration>,
) -> anyhow::Result<RunSummary> {
    config.validate()?;

    let tasks: Vec<Task<SimulatedTransfer>> = (1..=config.simulation.tasks)
        .map(|i| {
            Task::new(
                format!("transfer-{i:02}"),
                SimulatedTransfer::new(runtime.clone(), &config.simulation),
            )
        })
        .collect();
    let doomed = tasks.iter().filter(|task| task.job().will_fail()).count();

    let collection = TaskCollection::from_tasks(tasks.clone())?;
    let group = TaskGroup::from_config(&config.group, collection)?;
    group.subscribe(log_group_event);

    info!(
        group = %group.id(),
        tasks = tasks.len(),
        doomed,
        max_running = group.max_running_tasks(),
        "Starting simulation"
    );
    let started_at = Utc::now();
    group.execute()?;

    let mut cancelled = false;
    if let Some(after) = cancel_after
        && !group.wait_until_stopped(Some(after))
    {
        info!(group = %group.id(), "Cancel deadline reached");
        group.cancel()?;
        cancelled = true;
    }
    group.wait_until_stopped(None);
    let finished_at = Utc::now();

    let summary = RunSummary {
        group_id: group.id(),
        started_at,
        finished_at,
        elapsed_ms: (finished_at - started_at).num_milliseconds(),
        cancelled,
        progress: group.progress(),
        snapshot: group.snapshot(),
        tasks: tasks
            .iter()
            .map(|task| TaskSummary {
                name: task.name().to_string(),
                status: task.status(),
                progress: task.progress(),
            })
            .collect(),
    };
    group.dispose();
    Ok(summary)
}

fn log_group_event(event: &GroupEvent) {
    match event {
        GroupEvent::Started { group_id } => info!(group = %group_id, "Group started"),
        GroupEvent::Stopped { group_id } => info!(group = %group_id, "Group stopped"),
        GroupEvent::TaskStarted { task_id, .. } => debug!(task = %task_id, "Transfer started"),
        GroupEvent::TaskStopped {
            task_id, status, ..
        } => info!(task = %task_id, %status, "Transfer finished"),
        GroupEvent::StatusChanged { snapshot, .. } => debug!(?snapshot, "Group status"),
        GroupEvent::ProgressChanged { progress, .. } => debug!(progress, "Group progress"),
        GroupEvent::TaskStatusChanged { .. } => {}
    }
}
