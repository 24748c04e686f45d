//! Simulated device queue
//!
//! Commands are executed by worker threads in submission order of pickup.
//! Each command first waits for its dependencies, then runs its operation
//! and completes its event. An in-order queue has exactly one worker.
//!
//! A command has two kinds of dependencies. A failed `deps` entry fails the
//! command with `DependencyFailed`; `after` entries only order it, their
//! status is ignored once complete.
//!
//! Dependencies always point at earlier submissions (or at events from other
//! queues), so a worker blocked on a dependency never waits on a command that
//! is still behind it in the channel.

use crate::config::QueueType;
use crate::error::{Result, RuntimeError};
use crate::event::EventPtr;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Work executed by a queue worker
pub type DeviceOp = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Command {
    event: EventPtr,
    deps: Vec<EventPtr>,
    after: Vec<EventPtr>,
    op: Option<DeviceOp>,
    label: &'static str,
}

/// What a dependency set means for the command waiting on it
#[derive(Debug, Default)]
pub struct Dependencies {
    /// Failure of any of these fails the command
    pub deps: Vec<EventPtr>,
    /// Ordering only
    pub after: Vec<EventPtr>,
}

impl Dependencies {
    pub fn new(deps: Vec<EventPtr>) -> Self {
        Self { deps, after: Vec::new() }
    }

    pub fn ordering(after: Vec<EventPtr>) -> Self {
        Self { deps: Vec::new(), after }
    }
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Worker-backed command queue of one device
pub struct DeviceQueue {
    id: u64,
    queue_type: QueueType,
    sender: Mutex<Option<Sender<Command>>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
    failure: Arc<Mutex<Option<RuntimeError>>>,
}

impl DeviceQueue {
    pub fn new(queue_type: QueueType, workers: usize) -> Result<Self> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let worker_count = match queue_type {
            QueueType::InOrder => 1,
            QueueType::OutOfOrder => workers.max(1),
        };

        let (sender, receiver) = mpsc::channel::<Command>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Pending::default());
        let failure = Arc::new(Mutex::new(None));

        let handles = (0..worker_count)
            .map(|index| {
                let receiver = receiver.clone();
                let pending = pending.clone();
                let failure = failure.clone();
                thread::Builder::new()
                    .name(format!("hologram-queue-{id}-{index}"))
                    .spawn(move || worker_loop(id, &receiver, &pending, &failure))
                    .map_err(|e| RuntimeError::execution_failed("spawn queue worker", e))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(queue = id, ?queue_type, workers = worker_count, "device queue started");
        Ok(Self {
            id,
            queue_type,
            sender: Mutex::new(Some(sender)),
            workers: handles,
            pending,
            failure,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn is_in_order(&self) -> bool {
        self.queue_type == QueueType::InOrder
    }

    /// Commands submitted and not yet completed
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// First command failure since the last call
    pub fn take_failure(&self) -> Option<RuntimeError> {
        self.failure.lock().take()
    }

    /// Hand a command to the workers. `op == None` submits a pure
    /// synchronization point (marker or barrier).
    pub fn submit(&self, event: EventPtr, deps: Dependencies, op: Option<DeviceOp>, label: &'static str) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(RuntimeError::QueueClosed)?;

        let Dependencies { deps, after } = deps;
        tracing::trace!(
            queue = self.id,
            stamp = event.stamp(),
            deps = deps.len(),
            after = after.len(),
            label,
            "submit"
        );
        self.pending.increment();
        let command = Command { event, deps, after, op, label };
        sender.send(command).map_err(|mpsc::SendError(command)| {
            command.event.complete(Err(RuntimeError::QueueClosed));
            self.pending.decrement();
            RuntimeError::QueueClosed
        })
    }

    /// Block until every submitted command has completed.
    pub fn wait_idle(&self) {
        let start = Instant::now();
        let mut count = self.pending.count.lock();
        let waited_for = *count;
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
        drop(count);
        if waited_for > 0 {
            hologram_tracing::performance::record_queue_wait(self.id, waited_for, start.elapsed().as_micros() as u64);
        }
    }
}

fn worker_loop(
    queue: u64,
    receiver: &Mutex<Receiver<Command>>,
    pending: &Pending,
    failure: &Mutex<Option<RuntimeError>>,
) {
    loop {
        let command = match receiver.lock().recv() {
            Ok(command) => command,
            Err(_) => break,
        };
        if let Err(err) = run_command(queue, command) {
            failure.lock().get_or_insert(err);
        }
        pending.decrement();
    }
    tracing::trace!(queue, "queue worker exiting");
}

fn run_command(queue: u64, command: Command) -> Result<()> {
    let Command { event, deps, after, op, label } = command;

    for dep in &after {
        if let Err(err) = dep.wait() {
            tracing::trace!(queue, stamp = event.stamp(), label, error = %err, "ordering dependency failed");
        }
    }
    for dep in &deps {
        if let Err(err) = dep.wait() {
            tracing::debug!(queue, stamp = event.stamp(), label, error = %err, "dependency failed; skipping");
            let err = RuntimeError::dependency_failed(err);
            event.complete(Err(err.clone()));
            return Err(err);
        }
    }

    event.mark_started();
    let result = match op {
        Some(op) => catch_unwind(AssertUnwindSafe(op)).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err(RuntimeError::execution_failed(label, message))
        }),
        None => Ok(()),
    };

    if let Err(err) = &result {
        tracing::warn!(queue, stamp = event.stamp(), label, error = %err, "device operation failed");
    }
    event.complete(result.clone());
    result
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(queue = self.id, "queue worker panicked");
            }
        }
        tracing::debug!(queue = self.id, "device queue stopped");
    }
}
