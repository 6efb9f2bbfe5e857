use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PoolError, Result};

/// Default prefix for worker thread names.
const DEFAULT_THREAD_NAME: &str = "workerpool";

/// How a pool brings its workers into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrowthPolicy {
    /// All workers are spawned when the pool is built.
    #[default]
    Fixed,
    /// Workers are spawned on submission, up to the maximum, when none is idle.
    OnDemand,
}

impl fmt::Display for GrowthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrowthPolicy::Fixed => f.write_str("fixed"),
            GrowthPolicy::OnDemand => f.write_str("on-demand"),
        }
    }
}

impl FromStr for GrowthPolicy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(GrowthPolicy::Fixed),
            "on-demand" | "on_demand" | "ondemand" => Ok(GrowthPolicy::OnDemand),
            other => Err(PoolError::Config(format!(
                "unknown growth policy '{}', expected 'fixed' or 'on-demand'",
                other
            ))),
        }
    }
}

/// A single named construction option.
///
/// Options are validated one by one as they are applied; the last occurrence
/// of an option wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOption {
    /// Upper bound on concurrent workers. Required, must be at least 1.
    MaxWorkers(usize),
    /// Bounded queue size. Zero means synchronous handoff to a worker.
    QueueCapacity(usize),
    /// Maximum time `serve` may block.
    SubmitTimeout(Duration),
    /// Maximum time `stop` waits for the pool to drain.
    ShutdownTimeout(Duration),
    /// Whether workers are pre-spawned or spawned lazily.
    Growth(GrowthPolicy),
    /// Prefix used to name worker threads.
    ThreadName(String),
}

impl PoolOption {
    fn validate(&self) -> Result<()> {
        match self {
            PoolOption::MaxWorkers(0) => Err(PoolError::Config(
                "max workers must be at least 1".to_owned(),
            )),
            PoolOption::ThreadName(name) => validate_thread_name(name),
            _ => Ok(()),
        }
    }
}

/// Immutable pool configuration, built once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrent workers.
    pub max_workers: usize,
    /// Queue capacity; `None` is unbounded, `Some(0)` is synchronous handoff.
    pub queue_capacity: Option<usize>,
    /// Maximum blocking duration for `serve`; `None` blocks indefinitely.
    #[serde(with = "millis", rename = "submit_timeout_ms")]
    pub submit_timeout: Option<Duration>,
    /// Bound on `stop`'s drain; `None` always drains to completion.
    #[serde(with = "millis", rename = "shutdown_timeout_ms")]
    pub shutdown_timeout: Option<Duration>,
    /// Worker growth policy.
    pub growth: GrowthPolicy,
    /// Worker thread name prefix.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            queue_capacity: None,
            submit_timeout: None,
            shutdown_timeout: None,
            growth: GrowthPolicy::Fixed,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl PoolConfig {
    /// Builds a configuration from a set of options.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if `MaxWorkers` is absent or any option
    /// carries an invalid value.
    pub fn from_options<I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = PoolOption>,
    {
        let mut config = PoolConfig::default();
        let mut max_workers = None;

        for option in options {
            option.validate()?;
            match option {
                PoolOption::MaxWorkers(n) => max_workers = Some(n),
                PoolOption::QueueCapacity(n) => config.queue_capacity = Some(n),
                PoolOption::SubmitTimeout(d) => config.submit_timeout = Some(d),
                PoolOption::ShutdownTimeout(d) => config.shutdown_timeout = Some(d),
                PoolOption::Growth(policy) => config.growth = policy,
                PoolOption::ThreadName(name) => config.thread_name = name,
            }
        }

        config.max_workers = max_workers
            .ok_or_else(|| PoolError::Config("max workers is required".to_owned()))?;
        Ok(config)
    }

    /// Reads a JSON configuration file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: PoolConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration that did not come through `from_options`.
    pub fn validate(&self) -> Result<()> {
        PoolOption::MaxWorkers(self.max_workers).validate()?;
        validate_thread_name(&self.thread_name)
    }
}

fn validate_thread_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PoolError::Config("thread name must not be empty".to_owned()));
    }
    if name.as_bytes().contains(&0) {
        return Err(PoolError::Config(
            "thread name must not contain null bytes".to_owned(),
        ));
    }
    Ok(())
}

/// Serializes optional durations as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::ser::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => {
                let ms = u64::try_from(d.as_millis()).map_err(|_| {
                    S::Error::custom(format!("duration of {:?} overflows u64 milliseconds", d))
                })?;
                serializer.serialize_some(&ms)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
