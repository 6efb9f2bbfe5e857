use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use log::{error, info};

use super::{Handler, PoolStats, WorkerPool};
use crate::config::{GrowthPolicy, PoolConfig, PoolOption};
use crate::{PoolError, Result};

/// A pool backed by the `rayon` library.
///
/// Tasks go straight onto rayon's work-stealing scheduler, so there is no
/// bounded queue and no submit timeout; it serves as a baseline for the
/// shared-queue [`Pool`](super::Pool). `stop` always drains to completion.
pub struct RayonPool<T: Send + 'static> {
    pool: rayon::ThreadPool,
    handler: Arc<dyn Handler<T>>,
    pending: Arc<Pending>,
    running: AtomicBool,
}

/// Tasks accepted but not yet finished.
struct Pending {
    count: Mutex<usize>,
    done: Condvar,
    completed: AtomicUsize,
    panicked: AtomicUsize,
}

impl Pending {
    fn finish(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.done.notify_all();
        }
    }
}

impl<T: Send + 'static> RayonPool<T> {
    /// Builds a rayon-backed pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` for invalid options and for options this
    /// backend cannot honour: a queue capacity, a submit or shutdown timeout,
    /// or on-demand growth.
    pub fn new<H, I>(handler: H, options: I) -> Result<Self>
    where
        H: Handler<T>,
        I: IntoIterator<Item = PoolOption>,
    {
        let config = PoolConfig::from_options(options)?;
        Self::with_config(handler, config)
    }

    /// Builds a rayon-backed pool from a complete configuration.
    pub fn with_config<H>(handler: H, config: PoolConfig) -> Result<Self>
    where
        H: Handler<T>,
    {
        config.validate()?;
        let unsupported = if config.queue_capacity.is_some() {
            Some("queue capacity")
        } else if config.submit_timeout.is_some() {
            Some("submit timeout")
        } else if config.shutdown_timeout.is_some() {
            Some("shutdown timeout")
        } else if config.growth == GrowthPolicy::OnDemand {
            Some("on-demand growth")
        } else {
            None
        };
        if let Some(option) = unsupported {
            return Err(PoolError::Config(format!(
                "the rayon backend does not support {}",
                option
            )));
        }

        let name = config.thread_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers)
            .thread_name(move |i| format!("{}-{}", name, i))
            .build()?;
        info!(
            "Rayon pool '{}' started with {} threads",
            config.thread_name,
            pool.current_num_threads()
        );

        Ok(RayonPool {
            pool,
            handler: Arc::new(handler),
            pending: Arc::new(Pending {
                count: Mutex::new(0),
                done: Condvar::new(),
                completed: AtomicUsize::new(0),
                panicked: AtomicUsize::new(0),
            }),
            running: AtomicBool::new(true),
        })
    }

    /// Submits a task. Never blocks.
    pub fn serve(&self, task: T) -> Result<()> {
        {
            let mut count = self
                .pending
                .count
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.running.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }
            *count += 1;
        }

        let handler = Arc::clone(&self.handler);
        let pending = Arc::clone(&self.pending);
        self.pool.spawn(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(task))) {
                Ok(()) => {
                    pending.completed.fetch_add(1, Ordering::AcqRel);
                }
                Err(_) => {
                    pending.panicked.fetch_add(1, Ordering::AcqRel);
                    error!("Rayon job panicked, continuing");
                }
            }
            pending.finish();
        });
        Ok(())
    }

    /// Refuses new tasks and waits for accepted ones to finish.
    pub fn stop(&self) -> Result<()> {
        let count = self
            .pending
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.running.store(false, Ordering::Release);
        let _count = self
            .pending
            .done
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(())
    }

    /// Whether the pool accepts tasks.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of rayon threads while running, zero once stopped.
    pub fn worker_count(&self) -> usize {
        if self.running() {
            self.pool.current_num_threads()
        } else {
            0
        }
    }

    /// A snapshot of the pool counters.
    ///
    /// Rayon exposes no idle/busy split, so `queued` counts every accepted
    /// task that has not finished yet.
    pub fn stats(&self) -> PoolStats {
        let queued = *self
            .pending
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        PoolStats {
            workers: self.worker_count(),
            queued,
            completed: self.pending.completed.load(Ordering::Acquire),
            panicked: self.pending.panicked.load(Ordering::Acquire),
            ..PoolStats::default()
        }
    }
}

impl<T: Send + 'static> WorkerPool<T> for RayonPool<T> {
    fn serve(&self, task: T) -> Result<()> {
        RayonPool::serve(self, task)
    }

    fn stop(&self) -> Result<()> {
        RayonPool::stop(self)
    }

    fn running(&self) -> bool {
        RayonPool::running(self)
    }

    fn worker_count(&self) -> usize {
        RayonPool::worker_count(self)
    }

    fn stats(&self) -> PoolStats {
        RayonPool::stats(self)
    }
}

impl<T: Send + 'static> Drop for RayonPool<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping rayon pool on drop: {}", e);
        }
    }
}
