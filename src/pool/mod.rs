use serde::{Deserialize, Serialize};

use crate::Result;

/// A function run once per accepted task.
///
/// Several workers call the same handler concurrently, so any state it
/// captures must carry its own synchronization.
pub trait Handler<T>: Send + Sync + 'static {
    /// Processes one task.
    fn handle(&self, task: T);
}

impl<T, F> Handler<T> for F
where
    F: Fn(T) + Send + Sync + 'static,
{
    fn handle(&self, task: T) {
        self(task)
    }
}

/// A pool that runs submitted tasks on a bounded set of workers.
///
/// Implementors differ in how they schedule work but share the same
/// submission and shutdown contract.
pub trait WorkerPool<T>: Send + Sync {
    /// Submits a task.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` once shutdown has begun and
    /// `PoolError::Timeout` if the submit deadline elapses first.
    fn serve(&self, task: T) -> Result<()>;

    /// Stops accepting tasks and waits for accepted ones to finish.
    ///
    /// Calling it again after it returned is a no-op.
    fn stop(&self) -> Result<()>;

    /// Whether the pool still accepts tasks.
    fn running(&self) -> bool;

    /// Number of live workers.
    fn worker_count(&self) -> usize;

    /// A snapshot of the pool counters.
    fn stats(&self) -> PoolStats;
}

/// A point-in-time snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live workers.
    pub workers: usize,
    /// Workers waiting for a task.
    pub idle: usize,
    /// Workers running the handler.
    pub busy: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Handler invocations that returned normally.
    pub completed: usize,
    /// Handler invocations that panicked.
    pub panicked: usize,
    /// Accepted tasks dropped by a forced shutdown.
    pub rejected: usize,
}

mod rayon_pool;
mod shared_queue;

pub use self::rayon_pool::RayonPool;
pub use self::shared_queue::{Pool, PoolState};
