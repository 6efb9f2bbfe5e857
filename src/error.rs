use std::io;
use thiserror::Error;

/// Error type for worker pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Invalid construction parameters.
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// A task was submitted after shutdown began.
    #[error("pool is closed")]
    Closed,

    /// The submit deadline elapsed before the task was accepted.
    #[error("timed out waiting to submit task")]
    Timeout,

    /// The shutdown deadline elapsed before the pool drained.
    #[error("shutdown timed out: {workers} worker(s) abandoned, {rejected} queued task(s) rejected")]
    ShutdownTimeout {
        /// Workers still running a handler when the deadline passed.
        workers: usize,
        /// Queued tasks dropped without running.
        rejected: usize,
    },

    /// IO error from spawning threads or reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error.
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The rayon backend could not be built.
    #[error("rayon pool error: {0}")]
    Rayon(#[from] rayon::ThreadPoolBuildError),
}

/// Result type alias for worker pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
