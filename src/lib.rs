#![deny(missing_docs)]

//! A bounded, reusable worker pool.
//!
//! Callers build a [`Pool`] around a [`Handler`], submit tasks with
//! [`Pool::serve`], and shut it down with [`Pool::stop`], which drains every
//! accepted task before returning. Workers are long-lived threads pulling
//! from a shared FIFO [`DispatchQueue`]; the queue can be unbounded, bounded,
//! or a zero-capacity rendezvous channel for synchronous handoff.

mod config;
mod error;
/// Worker pool implementations sharing the [`WorkerPool`] contract.
pub mod pool;
mod queue;
mod worker;

pub use config::{GrowthPolicy, PoolConfig, PoolOption};
pub use error::{PoolError, Result};
pub use pool::{Handler, Pool, PoolState, PoolStats, RayonPool, WorkerPool};
pub use queue::{DispatchQueue, QueueReceiver};
