use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

use crate::pool::Handler;
use crate::queue::QueueReceiver;

/// Lifecycle status of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerStatus {
    /// Waiting on the queue.
    Idle,
    /// Running the handler.
    Busy,
    /// Exited its loop.
    Stopped,
}

/// Bookkeeping shared by the workers of one pool.
///
/// Holds no reference to the pool itself. Slot counts are reserved before a
/// worker thread is spawned, so `live` never exceeds the configured maximum.
pub(crate) struct WorkerGroup {
    name: String,
    live: AtomicUsize,
    idle: AtomicUsize,
    busy: AtomicUsize,
    next_id: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
    rejected: AtomicUsize,
    abandoned: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    lock: Mutex<()>,
    changed: Condvar,
}

impl WorkerGroup {
    pub(crate) fn new(name: String) -> Self {
        WorkerGroup {
            name,
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            panicked: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            abandoned: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    /// Claims a worker slot if fewer than `max` are in use. The new worker
    /// counts as idle from this point on.
    pub(crate) fn reserve(&self, max: usize) -> bool {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.live.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.idle.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Gives back a slot whose worker never started.
    pub(crate) fn unreserve(&self) {
        self.idle.fetch_sub(1, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.notify();
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn idle(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn panicked(&self) -> usize {
        self.panicked.load(Ordering::Acquire)
    }

    pub(crate) fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Acquire)
    }

    pub(crate) fn add_rejected(&self, n: usize) {
        self.rejected.fetch_add(n, Ordering::AcqRel);
    }

    /// From now on workers discard what they pop instead of running it.
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Wakes threads blocked in [`WorkerGroup::wait_for`].
    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.changed.notify_all();
    }

    /// Blocks until `done` holds, re-checking whenever a worker exits or
    /// [`WorkerGroup::notify`] is called. Returns `false` on timeout.
    pub(crate) fn wait_for<F>(&self, done: F, timeout: Option<Duration>) -> bool
    where
        F: Fn() -> bool,
    {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            None => {
                let _guard = self
                    .changed
                    .wait_while(guard, |_| !done())
                    .unwrap_or_else(PoisonError::into_inner);
                true
            }
            Some(timeout) => {
                let (_guard, result) = self
                    .changed
                    .wait_timeout_while(guard, timeout, |_| !done())
                    .unwrap_or_else(PoisonError::into_inner);
                !result.timed_out()
            }
        }
    }

    /// Joins every worker thread spawned so far.
    pub(crate) fn join_all(&self) {
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                debug!("Joined a worker that terminated abnormally");
            }
        }
    }

    /// Forgets the join handles, leaving any running threads detached.
    pub(crate) fn detach_all(&self) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Everything a worker needs: the queue, the handler and the group record.
pub(crate) struct WorkerContext<T> {
    pub(crate) queue: QueueReceiver<T>,
    pub(crate) handler: Arc<dyn Handler<T>>,
    pub(crate) group: Arc<WorkerGroup>,
}

impl<T> Clone for WorkerContext<T> {
    fn clone(&self) -> Self {
        WorkerContext {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            group: Arc::clone(&self.group),
        }
    }
}

/// Spawns a worker thread into a slot already claimed with
/// [`WorkerGroup::reserve`].
pub(crate) fn spawn<T: Send + 'static>(ctx: WorkerContext<T>) -> io::Result<()> {
    let group = Arc::clone(&ctx.group);
    let id = group.next_id.fetch_add(1, Ordering::Relaxed);
    let handle = thread::Builder::new()
        .name(format!("{}-{}", group.name, id))
        .spawn(move || Worker::new(id, ctx).run())?;
    group
        .handles
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(handle);
    Ok(())
}

struct Worker<T: Send + 'static> {
    id: usize,
    status: WorkerStatus,
    ctx: WorkerContext<T>,
}

impl<T: Send + 'static> Worker<T> {
    fn new(id: usize, ctx: WorkerContext<T>) -> Self {
        Worker {
            id,
            status: WorkerStatus::Idle,
            ctx,
        }
    }

    fn run(mut self) {
        debug!("Worker {} started", self.id);

        while let Some(task) = self.ctx.queue.pop() {
            if self.ctx.group.is_abandoned() {
                self.ctx.group.add_rejected(1);
                continue;
            }

            self.set_status(WorkerStatus::Busy);
            let handler = &self.ctx.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(task))) {
                Ok(()) => {
                    self.ctx.group.completed.fetch_add(1, Ordering::AcqRel);
                }
                Err(payload) => {
                    self.ctx.group.panicked.fetch_add(1, Ordering::AcqRel);
                    error!(
                        "Worker {} handler panicked, continuing: {}",
                        self.id,
                        panic_message(&*payload)
                    );
                }
            }
            self.set_status(WorkerStatus::Idle);
        }

        debug!("Worker {}: queue closed, shutting down", self.id);
        self.set_status(WorkerStatus::Stopped);
    }

    fn set_status(&mut self, next: WorkerStatus) {
        if self.status == next {
            return;
        }
        let group = &self.ctx.group;
        match self.status {
            WorkerStatus::Idle => group.idle.fetch_sub(1, Ordering::AcqRel),
            WorkerStatus::Busy => group.busy.fetch_sub(1, Ordering::AcqRel),
            WorkerStatus::Stopped => 0,
        };
        match next {
            WorkerStatus::Idle => group.idle.fetch_add(1, Ordering::AcqRel),
            WorkerStatus::Busy => group.busy.fetch_add(1, Ordering::AcqRel),
            WorkerStatus::Stopped => 0,
        };
        self.status = next;
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        let group = Arc::clone(&self.ctx.group);
        match self.status {
            WorkerStatus::Idle => {
                group.idle.fetch_sub(1, Ordering::AcqRel);
            }
            WorkerStatus::Busy => {
                group.busy.fetch_sub(1, Ordering::AcqRel);
            }
            WorkerStatus::Stopped => {}
        }
        self.status = WorkerStatus::Stopped;

        if thread::panicking() && !group.is_abandoned() {
            error!("Worker {} terminated abnormally, spawning a replacement", self.id);
            // The slot passes to the replacement.
            group.idle.fetch_add(1, Ordering::AcqRel);
            match spawn(self.ctx.clone()) {
                Ok(()) => return,
                Err(e) => {
                    error!("Failed to spawn a replacement worker: {}", e);
                    group.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        group.live.fetch_sub(1, Ordering::AcqRel);
        group.notify();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
