use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use taskgroup::{
    GroupEvent, GroupStatus, Job, Task, TaskCollection, TaskGroup, TaskHandle, TaskStatus,
    WaitHandle,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Transfer that finishes on a worker thread after a short delay and
/// records how many transfers overlap.
struct Transfer {
    duration: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    cancelled: WaitHandle,
}

impl Job for Transfer {
    fn execute(&self, task: &TaskHandle) -> anyhow::Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let task = task.clone();
        let active = self.active.clone();
        let duration = self.duration;
        let cancelled = self.cancelled.clone();
        thread::spawn(move || {
            let interrupted = cancelled.wait_timeout(duration);
            let _ = task.set_progress(if interrupted { 50 } else { 100 });
            active.fetch_sub(1, Ordering::SeqCst);
            task.set_status(if interrupted {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Succeeded
            });
        });
        Ok(())
    }

    fn cancel(&self, _task: &TaskHandle) -> anyhow::Result<()> {
        self.cancelled.set();
        Ok(())
    }
}

struct Fixture {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn task(&self, name: impl Into<String>, millis: u64) -> Task<Transfer> {
        Task::new(
            name,
            Transfer {
                duration: Duration::from_millis(millis),
                active: self.active.clone(),
                peak: self.peak.clone(),
                cancelled: WaitHandle::new(),
            },
        )
    }

    fn tasks(&self, count: usize, millis: u64) -> Vec<Task<Transfer>> {
        (0..count)
            .map(|i| self.task(format!("transfer-{i}"), millis))
            .collect()
    }
}

fn record(group: &TaskGroup<Transfer>) -> Arc<Mutex<Vec<GroupEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    group.subscribe(move |event| sink.lock().push(event.clone()));
    events
}

fn stopped_events(events: &Mutex<Vec<GroupEvent>>) -> usize {
    events
        .lock()
        .iter()
        .filter(|event| matches!(event, GroupEvent::Stopped { .. }))
        .count()
}

#[test]
fn test_many_tasks_never_exceed_limit() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks(24, 10);
    let group = TaskGroup::new(3, TaskCollection::from_tasks(tasks.clone()).unwrap()).unwrap();
    let events = record(&group);

    let max_seen = Arc::new(AtomicUsize::new(0));
    {
        let max_seen = max_seen.clone();
        group
            .status_manager()
            .subscribe(move |snapshot| {
                max_seen.fetch_max(snapshot.running, Ordering::SeqCst);
            });
    }

    group.execute().unwrap();
    assert!(group.wait_until_stopped(Some(TIMEOUT)));

    assert!(fixture.peak.load(Ordering::SeqCst) <= 3);
    assert!(max_seen.load(Ordering::SeqCst) <= 3);
    assert_eq!(group.completed_tasks(), 24);
    assert_eq!(group.remaining_tasks(), 0);
    assert_eq!(stopped_events(&events), 1);
    assert!(!group.is_executing());
    assert!(tasks.iter().all(|task| task.status() == TaskStatus::Succeeded));
}

#[test]
fn test_collection_churn_during_execution() {
    let fixture = Fixture::new();
    let group = TaskGroup::new(2, TaskCollection::from_tasks(fixture.tasks(6, 15)).unwrap())
        .unwrap();
    group.execute().unwrap();

    // Add while running, remove whatever has not started yet
    let late = fixture.tasks(4, 5);
    group.collection().add_range(late.clone()).unwrap();
    let unstarted: Vec<_> = late
        .iter()
        .filter(|task| task.status() == TaskStatus::Ready)
        .take(2)
        .map(|task| task.id())
        .collect();
    let removed = group.collection().remove_range(&unstarted);

    assert!(group.wait_until_stopped(Some(TIMEOUT)));
    assert!(fixture.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(group.remaining_tasks(), 0);
    assert_eq!(group.running_tasks(), 0);
    assert_eq!(group.collection().len(), 10 - removed.len());
    assert!(removed.iter().all(|task| task.group_id().is_none()));
}

#[test]
fn test_cancel_then_resume() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks(4, 2_000);
    let group = TaskGroup::new(2, TaskCollection::from_tasks(tasks.clone()).unwrap()).unwrap();

    group.execute().unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while group.running_tasks() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    group.cancel().unwrap();
    assert!(group.wait_until_stopped(Some(TIMEOUT)));
    let cancelled = tasks
        .iter()
        .filter(|task| task.status() == TaskStatus::Cancelled)
        .count();
    assert_eq!(cancelled, 2);
    assert_eq!(group.completed_tasks(), 0);
    assert_eq!(group.remaining_tasks(), 2);

    // The untouched tasks are picked up by the next execution
    group.execute().unwrap();
    assert!(group.is_executing());
    group.dispose();
    assert!(!group.is_executing());
}

#[test]
fn test_status_reflects_outcomes() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks(3, 5);
    tasks[2].set_status(TaskStatus::Failed);
    let group = TaskGroup::new(0, TaskCollection::from_tasks(tasks).unwrap()).unwrap();
    assert_eq!(group.remaining_tasks(), 2);

    group.execute().unwrap();
    assert!(group.wait_until_stopped(Some(TIMEOUT)));

    let deadline = Instant::now() + TIMEOUT;
    while group.status() != GroupStatus::Failed && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(group.status(), GroupStatus::Failed);
    assert_eq!(group.completed_tasks(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_group_inside_runtime() {
    let fixture = Fixture::new();
    let group = TaskGroup::new(2, TaskCollection::from_tasks(fixture.tasks(5, 5)).unwrap()).unwrap();
    let events = record(&group);

    group.execute().unwrap();
    let finished = tokio::task::spawn_blocking(move || {
        let stopped = group.wait_until_stopped(Some(TIMEOUT));
        let completed = group.completed_tasks();
        group.dispose();
        (stopped, completed)
    })
    .await
    .unwrap();

    assert_eq!(finished, (true, 5));
    assert_eq!(stopped_events(&events), 1);
}
