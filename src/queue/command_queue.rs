use crate::env::threads::DISPATCH_THREAD_NAME;
use crate::error::{Result, TaskGroupError};
use crate::logging::{ExceptionLogger, TracingExceptionLogger, panic_to_error};
use crate::sync::{Listener, Listeners, SubscriptionId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, trace, warn};

/// Deferred unit of work executed by the queue
pub type Command = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Notifications bracketing each drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// About to execute the pending commands
    Processing,
    /// The pending commands have been executed
    Processed,
}

/// Single-consumer FIFO dispatcher for deferred commands.
///
/// Producers on any thread enqueue commands without blocking. The first
/// registration on an idle queue schedules one drain on the runtime's
/// blocking pool; that drain runs commands one at a time, in enqueue order,
/// until the queue is empty. At most one drain is active per queue.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct AsyncCommandQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    idle: Condvar,
    runtime: Handle,
    logger: Arc<dyn ExceptionLogger>,
    events: Listeners<QueueEvent>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Command>,
    draining: bool,
    disposed: bool,
    drain_thread: Option<ThreadId>,
}

impl AsyncCommandQueue {
    /// Create a queue on the ambient tokio runtime, or on the process-wide
    /// dispatch runtime when called outside of one.
    pub fn new() -> Result<Self> {
        Self::with_logger(Arc::new(TracingExceptionLogger))
    }

    pub fn with_logger(logger: Arc<dyn ExceptionLogger>) -> Result<Self> {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => dispatch_runtime()?,
        };
        Ok(Self::with_runtime(runtime, logger))
    }

    /// Create a queue draining on the blocking pool of `runtime`
    pub fn with_runtime(runtime: Handle, logger: Arc<dyn ExceptionLogger>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
                runtime,
                logger,
                events: Listeners::new(),
            }),
        }
    }

    /// Enqueue one command
    pub fn register<F>(&self, command: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.register_all(std::iter::once(Box::new(command) as Command))
    }

    /// Enqueue several commands; they run back to back in iteration order
    pub fn register_all<I>(&self, commands: I) -> Result<()>
    where
        I: IntoIterator<Item = Command>,
    {
        let start_drain = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(TaskGroupError::Disposed("AsyncCommandQueue"));
            }
            let before = state.pending.len();
            state.pending.extend(commands);
            if state.pending.len() == before || state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if start_drain {
            let ticket = DrainTicket {
                shared: self.shared.clone(),
                started: false,
            };
            // The JoinHandle is dropped: the drain reports through `idle`, and
            // a drain the runtime refuses to run is reported by `DrainTicket`.
            drop(self.shared.runtime.spawn_blocking(move || ticket.run()));
        }
        Ok(())
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(Arc::new(listener) as Listener<QueueEvent>)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Number of commands waiting to run
    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a drain is scheduled or running
    pub fn is_processing(&self) -> bool {
        self.shared.state.lock().draining
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Whether the caller is currently running inside this queue's drain
    pub fn is_dispatch_thread(&self) -> bool {
        self.shared.state.lock().drain_thread == Some(thread::current().id())
    }

    /// Reject further registrations and drop the queued commands without
    /// waiting for the active drain.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.disposed = true;
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        if dropped > 0 {
            warn!(dropped, "Command queue closed with pending commands");
        }
    }

    /// Reject further registrations and wait for the active drain to finish.
    ///
    /// Commands already queued still run before this returns. When called
    /// from inside a command, the remaining queued commands are dropped
    /// instead, since the drain cannot be awaited from its own thread.
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;

        if state.drain_thread == Some(thread::current().id()) {
            let dropped = state.pending.len();
            state.pending.clear();
            if dropped > 0 {
                warn!(dropped, "Command queue disposed from its own drain");
            }
            return;
        }

        while state.draining {
            self.shared.idle.wait(&mut state);
        }
        drop(state);

        self.shared.events.clear();
        debug!("Command queue disposed");
    }
}

/// Moved into the scheduled drain. Dropped unrun when the runtime has shut
/// down, in which case the queue gives up the drain instead of waiting on it.
struct DrainTicket {
    shared: Arc<QueueShared>,
    started: bool,
}

impl DrainTicket {
    fn run(mut self) {
        self.started = true;
        self.shared.drain();
    }
}

impl Drop for DrainTicket {
    fn drop(&mut self) {
        if !self.started {
            self.shared.abandon_drain();
        }
    }
}

impl QueueShared {
    fn abandon_drain(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.draining = false;
            state.drain_thread = None;
            self.idle.notify_all();
            std::mem::take(&mut state.pending)
        };
        self.logger.log_exception(
            "command queue drain was not scheduled",
            &anyhow::anyhow!("runtime unavailable; {} queued commands dropped", dropped.len()),
        );
    }

    fn drain(&self) {
        self.state.lock().drain_thread = Some(thread::current().id());

        loop {
            self.notify(QueueEvent::Processing);

            let mut executed = 0usize;
            while let Some(command) = self.next_command() {
                self.run(command);
                executed += 1;
            }
            trace!(executed, "Command queue drained");

            self.notify(QueueEvent::Processed);

            let mut state = self.state.lock();
            if state.pending.is_empty() {
                state.draining = false;
                state.drain_thread = None;
                self.idle.notify_all();
                return;
            }
        }
    }

    fn next_command(&self) -> Option<Command> {
        self.state.lock().pending.pop_front()
    }

    fn run(&self, command: Command) {
        match catch_unwind(AssertUnwindSafe(command)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.logger.log_exception("queued command failed", &e),
            Err(payload) => self
                .logger
                .log_exception("queued command panicked", &panic_to_error(payload)),
        }
    }

    fn notify(&self, event: QueueEvent) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.events.emit(&event))) {
            self.logger
                .log_exception("queue listener panicked", &panic_to_error(payload));
        }
    }
}

/// Process-wide runtime used by queues created outside a tokio context
fn dispatch_runtime() -> Result<Handle> {
    static DISPATCH: OnceLock<Runtime> = OnceLock::new();

    if let Some(runtime) = DISPATCH.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(DISPATCH_THREAD_NAME)
        .enable_all()
        .build()
        .map_err(TaskGroupError::Runtime)?;

    Ok(DISPATCH.get_or_init(|| runtime).handle().clone())
}

impl std::fmt::Debug for AsyncCommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("AsyncCommandQueue")
            .field("pending", &state.pending.len())
            .field("draining", &state.draining)
            .field("disposed", &state.disposed)
            .finish()
    }
}
