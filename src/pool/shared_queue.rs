use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};

use super::{Handler, PoolStats, WorkerPool};
use crate::config::{GrowthPolicy, PoolConfig, PoolOption};
use crate::queue::DispatchQueue;
use crate::worker::{self, WorkerContext, WorkerGroup};
use crate::{PoolError, Result};

/// Lifecycle of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Being built; workers may be starting.
    Created,
    /// Accepting tasks.
    Running,
    /// Refusing tasks and draining.
    Stopping,
    /// Drained and released.
    Stopped,
}

impl PoolState {
    fn from_u8(value: u8) -> PoolState {
        match value {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

/// A worker pool fed through a shared dispatch queue.
///
/// Workers pull tasks from a single MPMC channel and hand each one to the
/// handler. A handler panic is caught and the worker carries on; a worker
/// thread that dies anyway is replaced. With [`GrowthPolicy::OnDemand`],
/// workers are only spawned by `serve` when none is idle.
///
/// Dropping a running pool stops it.
pub struct Pool<T: Send + 'static> {
    config: PoolConfig,
    handler: Arc<dyn Handler<T>>,
    queue: DispatchQueue<T>,
    workers: Arc<WorkerGroup>,
    state: AtomicU8,
    submitting: AtomicUsize,
    stop_lock: Mutex<()>,
}

impl<T: Send + 'static> Pool<T> {
    /// Builds a pool from a handler and a set of options.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` for missing or invalid options, and
    /// `PoolError::Io` if a worker thread cannot be spawned, in which case the
    /// workers already started are shut down.
    pub fn new<H, I>(handler: H, options: I) -> Result<Self>
    where
        H: Handler<T>,
        I: IntoIterator<Item = PoolOption>,
    {
        let config = PoolConfig::from_options(options)?;
        Self::start(Arc::new(handler), config)
    }

    /// Builds a pool from a complete configuration, e.g. one loaded from disk.
    pub fn with_config<H>(handler: H, config: PoolConfig) -> Result<Self>
    where
        H: Handler<T>,
    {
        config.validate()?;
        Self::start(Arc::new(handler), config)
    }

    fn start(handler: Arc<dyn Handler<T>>, config: PoolConfig) -> Result<Self> {
        let pool = Pool {
            queue: DispatchQueue::new(config.queue_capacity),
            workers: Arc::new(WorkerGroup::new(config.thread_name.clone())),
            handler,
            state: AtomicU8::new(PoolState::Created as u8),
            submitting: AtomicUsize::new(0),
            stop_lock: Mutex::new(()),
            config,
        };

        if pool.config.growth == GrowthPolicy::Fixed {
            for _ in 0..pool.config.max_workers {
                // On error, dropping the half-built pool stops what was spawned.
                pool.spawn_worker()?;
            }
        }

        pool.set_state(PoolState::Running);
        info!(
            "Pool '{}' started: {} growth, max {} workers, queue capacity {}",
            pool.config.thread_name,
            pool.config.growth,
            pool.config.max_workers,
            pool.queue
                .capacity()
                .map_or_else(|| "unbounded".to_owned(), |c| c.to_string()),
        );
        Ok(pool)
    }

    /// Submits a task.
    ///
    /// Blocks while the queue is full, for at most the configured submit
    /// timeout. With a zero-capacity queue, a worker that is idle or was just
    /// spawned for this task takes it without the timeout applying.
    ///
    /// # Errors
    ///
    /// `PoolError::Closed` once `stop` has begun, `PoolError::Timeout` if the
    /// submit timeout elapsed before the task was accepted.
    pub fn serve(&self, task: T) -> Result<()> {
        self.submitting.fetch_add(1, Ordering::SeqCst);
        let result = self.submit(task);
        if self.submitting.fetch_sub(1, Ordering::SeqCst) == 1 && !self.running() {
            self.workers.notify();
        }
        result
    }

    fn submit(&self, task: T) -> Result<()> {
        if !self.running() {
            return Err(PoolError::Closed);
        }

        if self.config.growth == GrowthPolicy::OnDemand && self.workers.idle() == 0 {
            match self.spawn_worker() {
                Ok(true) => debug!("Pool grew to {} workers", self.workers.live()),
                Ok(false) => {}
                Err(e) if self.workers.live() == 0 => return Err(e),
                Err(e) => warn!("Failed to grow pool, queueing on existing workers: {}", e),
            }
        }

        self.queue.push(task, self.config.submit_timeout)
    }

    /// Stops the pool.
    ///
    /// New submissions are refused immediately. The call then waits until
    /// every accepted task has run and every worker has exited. Once it has
    /// returned, further calls do nothing.
    ///
    /// # Errors
    ///
    /// If a shutdown timeout is configured and passes first, submitters still
    /// blocked get `PoolError::Closed`, tasks still queued are rejected,
    /// workers still busy are left to finish their current task, and
    /// `PoolError::ShutdownTimeout` is returned.
    pub fn stop(&self) -> Result<()> {
        let _guard = self.stop_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() == PoolState::Stopped {
            return Ok(());
        }

        self.set_state(PoolState::Stopping);
        info!(
            "Stopping pool '{}', {} task(s) queued",
            self.config.thread_name,
            self.queue.len()
        );
        self.queue.close();

        let workers = &self.workers;
        let submitting = &self.submitting;
        let drained = workers.wait_for(
            || submitting.load(Ordering::SeqCst) == 0 && workers.live() == 0,
            self.config.shutdown_timeout,
        );

        let result = if drained {
            workers.join_all();
            let leftover = self.queue.drain();
            if leftover > 0 {
                // Only reachable when every worker died and none could be replaced.
                warn!("Pool stopped with {} unprocessed task(s)", leftover);
                workers.add_rejected(leftover);
            }
            Ok(())
        } else {
            // Blocked submitters give up with `Closed`; no push lands after this.
            self.queue.abort();
            workers.wait_for(|| submitting.load(Ordering::SeqCst) == 0, None);

            let before = workers.rejected();
            workers.abandon();
            workers.add_rejected(self.queue.drain());
            let rejected = workers.rejected() - before;
            workers.detach_all();
            let abandoned = workers.live();
            warn!(
                "Pool '{}' shutdown timed out: abandoned {} worker(s), rejected {} task(s)",
                self.config.thread_name, abandoned, rejected
            );
            Err(PoolError::ShutdownTimeout {
                workers: abandoned,
                rejected,
            })
        };

        self.set_state(PoolState::Stopped);
        info!("Pool '{}' stopped", self.config.thread_name);
        result
    }

    /// Whether the pool accepts tasks.
    pub fn running(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.live()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// A snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.live(),
            idle: self.workers.idle(),
            busy: self.workers.busy(),
            queued: self.queue.len(),
            completed: self.workers.completed(),
            panicked: self.workers.panicked(),
            rejected: self.workers.rejected(),
        }
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Spawns a worker if a slot is free. Returns whether one was spawned.
    fn spawn_worker(&self) -> Result<bool> {
        if !self.workers.reserve(self.config.max_workers) {
            return Ok(false);
        }
        let ctx = WorkerContext {
            queue: self.queue.announced_receiver(),
            handler: Arc::clone(&self.handler),
            group: Arc::clone(&self.workers),
        };
        if let Err(e) = worker::spawn(ctx) {
            error!("Failed to spawn a worker thread: {}", e);
            self.workers.unreserve();
            return Err(e.into());
        }
        // Ready before its thread runs, so a handoff to it can't time out.
        self.queue.announce();
        Ok(true)
    }
}

impl<T: Send + 'static> WorkerPool<T> for Pool<T> {
    fn serve(&self, task: T) -> Result<()> {
        Pool::serve(self, task)
    }

    fn stop(&self) -> Result<()> {
        Pool::stop(self)
    }

    fn running(&self) -> bool {
        Pool::running(self)
    }

    fn worker_count(&self) -> usize {
        Pool::worker_count(self)
    }

    fn stats(&self) -> PoolStats {
        Pool::stats(self)
    }
}

impl<T: Send + 'static> Drop for Pool<T> {
    fn drop(&mut self) {
        if self.state() != PoolState::Stopped {
            if let Err(e) = self.stop() {
                error!("Error stopping pool on drop: {}", e);
            }
        }
    }
}
