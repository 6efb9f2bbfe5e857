use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use crossbeam::sync::WaitGroup;
use log::{error, info};
use serde::Serialize;

use workerpool::{GrowthPolicy, Pool, PoolConfig, PoolStats, RayonPool, Result, WorkerPool};

/// A task: the value to add, plus the completion signal it releases.
type Job = (u64, WaitGroup);

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Shared-queue pool
    Queue,
    /// Rayon-backed baseline
    Rayon,
}

impl Backend {
    fn name(self) -> &'static str {
        match self {
            Backend::Queue => "queue",
            Backend::Rayon => "rayon",
        }
    }
}

#[derive(Parser)]
#[command(name = "wp-bench", version, about = "Load harness for the worker pool")]
struct Cli {
    /// Number of tasks to submit
    #[arg(long, default_value_t = 100_000)]
    tasks: u64,

    /// Maximum number of workers [default: number of CPUs]
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Queue capacity; omit for unbounded, 0 for synchronous handoff
    #[arg(long, value_name = "N")]
    capacity: Option<usize>,

    /// Worker growth policy: "fixed" or "on-demand"
    #[arg(long, value_name = "POLICY")]
    growth: Option<GrowthPolicy>,

    /// Maximum time a submission may block
    #[arg(long, value_name = "MS")]
    submit_timeout_ms: Option<u64>,

    /// Maximum time shutdown may wait for the pool to drain
    #[arg(long, value_name = "MS")]
    shutdown_timeout_ms: Option<u64>,

    /// Pool implementation to drive
    #[arg(long, value_enum, default_value_t = Backend::Queue)]
    backend: Backend,

    /// JSON pool configuration; flags given here override its fields
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    backend: &'static str,
    tasks: u64,
    workers: usize,
    elapsed_ms: f64,
    tasks_per_sec: f64,
    sum: u64,
    expected: u64,
    stats: PoolStats,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    match run(cli) {
        Ok(report) => {
            print_report(&report, json);
            if report.sum != report.expected {
                error!(
                    "Sum mismatch: got {}, expected {}",
                    report.sum, report.expected
                );
                exit(1);
            }
        }
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<Report> {
    let config = build_config(&cli)?;
    let sum = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&sum);
    let handler = move |(value, done): Job| {
        counter.fetch_add(value, Ordering::Relaxed);
        drop(done);
    };

    let pool: Box<dyn WorkerPool<Job>> = match cli.backend {
        Backend::Queue => Box::new(Pool::with_config(handler, config)?),
        Backend::Rayon => Box::new(RayonPool::with_config(handler, config)?),
    };
    info!(
        "Submitting {} tasks to the {} backend",
        cli.tasks,
        cli.backend.name()
    );

    let wg = WaitGroup::new();
    let start = Instant::now();
    for i in 0..cli.tasks {
        pool.serve((i, wg.clone()))?;
    }
    wg.wait();
    let elapsed = start.elapsed();

    let workers = pool.worker_count();
    pool.stop()?;
    let stats = pool.stats();

    let secs = elapsed.as_secs_f64();
    Ok(Report {
        backend: cli.backend.name(),
        tasks: cli.tasks,
        workers,
        elapsed_ms: secs * 1000.0,
        tasks_per_sec: if secs > 0.0 { cli.tasks as f64 / secs } else { 0.0 },
        sum: sum.load(Ordering::Relaxed),
        expected: triangular(cli.tasks),
        stats,
    })
}

/// Loads the configuration file, if any, then applies the flags on top.
fn build_config(cli: &Cli) -> Result<PoolConfig> {
    let mut config = match &cli.config {
        Some(path) => PoolConfig::load(path)?,
        None => PoolConfig::default(),
    };

    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if cli.capacity.is_some() {
        config.queue_capacity = cli.capacity;
    }
    if let Some(growth) = cli.growth {
        config.growth = growth;
    }
    if let Some(ms) = cli.submit_timeout_ms {
        config.submit_timeout = Some(Duration::from_millis(ms));
    }
    if let Some(ms) = cli.shutdown_timeout_ms {
        config.shutdown_timeout = Some(Duration::from_millis(ms));
    }

    Ok(config)
}

/// Sum of `0..n`.
fn triangular(n: u64) -> u64 {
    if n == 0 {
        0
    } else {
        n.wrapping_mul(n - 1) / 2
    }
}

fn print_report(report: &Report, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
        return;
    }

    println!("backend:    {}", report.backend);
    println!("tasks:      {}", report.tasks);
    println!("workers:    {}", report.workers);
    println!("elapsed:    {:.3} ms", report.elapsed_ms);
    println!("throughput: {:.0} tasks/s", report.tasks_per_sec);
    println!("sum:        {} (expected {})", report.sum, report.expected);
    println!(
        "handled:    {} completed, {} panicked, {} rejected",
        report.stats.completed, report.stats.panicked, report.stats.rejected
    );
}
