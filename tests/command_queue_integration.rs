use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use taskgroup::{AsyncCommandQueue, QueueEvent, TaskGroupError};

fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_concurrent_registration_runs_each_command_once_and_alone() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 50;

    let queue = AsyncCommandQueue::new().unwrap();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = queue.clone();
            let delivered = delivered.clone();
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            thread::spawn(move || {
                for item in 0..PER_PRODUCER {
                    let delivered = delivered.clone();
                    let in_flight = in_flight.clone();
                    let overlaps = overlaps.clone();
                    queue
                        .register(move || {
                            if in_flight.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            delivered.lock().push((producer, item));
                            in_flight.store(false, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_for(|| delivered.lock().len() == PRODUCERS * PER_PRODUCER));
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    let delivered = delivered.lock();
    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);

    // Per-producer order is preserved
    for producer in 0..PRODUCERS {
        let items: Vec<usize> = delivered
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, item)| *item)
            .collect();
        assert_eq!(items, (0..PER_PRODUCER).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_uses_ambient_runtime() {
    let queue = AsyncCommandQueue::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        queue.subscribe(move |event: &QueueEvent| events.lock().push(*event));
    }

    for _ in 0..3 {
        let ran = ran.clone();
        queue
            .register(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    let probe = queue.clone();
    tokio::task::spawn_blocking(move || wait_for(|| probe.is_empty() && !probe.is_processing()))
        .await
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 3);

    let events = events.lock();
    assert_eq!(events.first(), Some(&QueueEvent::Processing));
    assert_eq!(events.last(), Some(&QueueEvent::Processed));
}

#[test]
fn test_registration_after_dispose_fails() {
    let queue = AsyncCommandQueue::new().unwrap();
    queue.dispose();

    assert!(queue.is_disposed());
    assert!(matches!(
        queue.register(|| Ok(())),
        Err(TaskGroupError::Disposed(_))
    ));
}
