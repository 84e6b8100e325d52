//! Throughput harness for tile kernels
//!
//! Each worker thread owns a private [`BenchWorkload`] and its own
//! [`TileContext`], configures it once with the plan's palette and calls the
//! engine `iterations` times. Nothing is shared between workers except the
//! read-only [`BenchConfig`].
//!
//! # Example
//!
//! ```
//! use tilemm::{Backend, BenchConfig};
//!
//! let config = BenchConfig::blocked(4)
//!     .with_backend(Backend::Reference)
//!     .with_iterations(3)
//!     .with_threads(2);
//! let report = tilemm::bench::run(&config).unwrap();
//!
//! assert_eq!(report.threads.len(), 2);
//! assert_eq!(report.threads[0].checksum, report.threads[1].checksum);
//! ```

use std::fmt;
use std::sync::Barrier;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::backends::{self, TileOps};
use crate::{
    AccumulatorPolicy, Backend, MatrixBuffer, Result, TileContext, TileError, TiledMatmul,
};

/// Benchmark configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    /// Timed engine calls per thread
    pub iterations: usize,
    /// Untimed engine calls per thread before timing starts
    pub warmup_iterations: usize,
    /// Independent worker threads
    pub threads: usize,
    /// Tile backend each worker creates
    pub backend: Backend,
    /// P: accumulator block rows
    pub row_blocks: usize,
    /// Q: accumulator block columns
    pub col_blocks: usize,
    /// T: reduction steps per call
    pub steps: usize,
    /// Accumulator load/store policy
    pub policy: AccumulatorPolicy,
    /// Constant every A element is filled with
    pub fill_a: i8,
    /// Constant every B element is filled with
    pub fill_b: i8,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            warmup_iterations: 0,
            threads: 1,
            backend: Backend::Auto,
            row_blocks: 1,
            col_blocks: 1,
            steps: 1,
            policy: AccumulatorPolicy::Resident,
            fill_a: 2,
            fill_b: 2,
        }
    }
}

impl BenchConfig {
    /// Default configuration: one 16×16×64 tile, one thread
    pub fn new() -> Self {
        Self::default()
    }

    /// One accumulator tile, one reduction step
    pub fn single_tile() -> Self {
        Self::default()
    }

    /// 2×2 accumulator blocks over `steps` reduction steps, two threads
    ///
    /// # Examples
    ///
    /// ```
    /// use tilemm::BenchConfig;
    ///
    /// let config = BenchConfig::blocked(16);
    /// assert_eq!((config.row_blocks, config.col_blocks, config.steps), (2, 2, 16));
    /// assert_eq!(config.plan().unwrap().ops_per_call(), 2 * 32 * 32 * 1024);
    /// ```
    pub fn blocked(steps: usize) -> Self {
        Self {
            row_blocks: 2,
            col_blocks: 2,
            steps,
            threads: 2,
            ..Self::default()
        }
    }

    /// Set timed iterations per thread
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set untimed warm-up iterations per thread
    pub fn with_warmup(mut self, iterations: usize) -> Self {
        self.warmup_iterations = iterations;
        self
    }

    /// Set the number of worker threads
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the backend
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the P×Q block layout
    pub fn with_blocks(mut self, row_blocks: usize, col_blocks: usize) -> Self {
        self.row_blocks = row_blocks;
        self.col_blocks = col_blocks;
        self
    }

    /// Set the number of reduction steps
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Set the accumulator policy
    pub fn with_policy(mut self, policy: AccumulatorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the constant fills of A and B
    pub fn with_fill(mut self, a: i8, b: i8) -> Self {
        self.fill_a = a;
        self.fill_b = b;
        self
    }

    /// The engine plan this configuration runs
    pub fn plan(&self) -> Result<TiledMatmul> {
        Ok(TiledMatmul::blocked(self.row_blocks, self.col_blocks, self.steps)?
            .with_policy(self.policy))
    }

    fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(TileError::InvalidInput(
                "benchmark needs at least one iteration".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(TileError::InvalidInput(
                "benchmark needs at least one thread".to_string(),
            ));
        }
        Ok(())
    }
}

/// One worker's private buffers
#[derive(Debug, Clone)]
pub struct BenchWorkload {
    /// `a[i][t]`: A tile of block row `i` at step `t`
    pub a: Vec<Vec<MatrixBuffer<i8>>>,
    /// `b[j][t]`: packed B tile of block column `j` at step `t`
    pub b: Vec<Vec<MatrixBuffer<i8>>>,
    /// Accumulator blocks, row-major over (i, j)
    pub c: Vec<MatrixBuffer<i32>>,
}

impl BenchWorkload {
    /// Constant-filled inputs and zeroed accumulators shaped for `plan`
    pub fn new(plan: &TiledMatmul, fill_a: i8, fill_b: i8) -> Self {
        let shape = plan.shape();
        let layout = plan.layout();
        let steps = |rows, cols, value| vec![MatrixBuffer::filled(rows, cols, value); layout.steps];
        BenchWorkload {
            a: (0..layout.row_blocks)
                .map(|_| steps(shape.m, shape.k, fill_a))
                .collect(),
            b: (0..layout.col_blocks)
                .map(|_| steps(shape.k / 4, 4 * shape.n, fill_b))
                .collect(),
            c: vec![MatrixBuffer::new(shape.m, shape.n); layout.accumulators()],
        }
    }

    /// Sum over every accumulator block
    pub fn checksum(&self) -> i64 {
        self.c.iter().map(MatrixBuffer::checksum).sum()
    }

    /// First cell of the first accumulator block
    pub fn first_cell(&self) -> i32 {
        self.c
            .first()
            .and_then(|block| block.get(0, 0).copied())
            .unwrap_or_default()
    }
}

/// Result of one worker
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadReport {
    /// Worker index (0-based)
    pub thread: usize,
    /// Backend the worker ran on
    pub backend: Backend,
    /// Timed iterations
    pub iterations: usize,
    /// Time spent in the timed iterations
    pub elapsed: Duration,
    /// Integer operations performed in the timed iterations
    pub ops: u64,
    /// Sum of the final accumulator blocks
    pub checksum: i64,
    /// First cell of the final accumulator blocks
    pub first_cell: i32,
}

impl ThreadReport {
    /// Throughput in giga-operations per second
    pub fn gops(&self) -> f64 {
        gops(self.ops, self.elapsed)
    }
}

impl fmt::Display for ThreadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Thread {} ({:?})", self.thread, self.backend)?;
        writeln!(f, "  iterations: {}", self.iterations)?;
        writeln!(f, "  elapsed:    {:.6} s", self.elapsed.as_secs_f64())?;
        writeln!(f, "  throughput: {:.3} GOPS", self.gops())?;
        write!(
            f,
            "  C[0][0] = {}, checksum = {}",
            self.first_cell, self.checksum
        )
    }
}

/// Result of a multi-threaded run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    /// Per-worker reports, ordered by worker index
    pub threads: Vec<ThreadReport>,
    /// Wall-clock time from the first worker's timed start to the last
    /// worker's timed end
    pub wall: Duration,
}

impl BenchReport {
    /// Operations over all workers
    pub fn total_ops(&self) -> u64 {
        self.threads.iter().map(|t| t.ops).sum()
    }

    /// Combined throughput over wall-clock time
    pub fn total_gops(&self) -> f64 {
        gops(self.total_ops(), self.wall)
    }

    /// `Σ thread elapsed − wall` in seconds; positive when workers overlapped
    pub fn overlap_secs(&self) -> f64 {
        let busy: f64 = self.threads.iter().map(|t| t.elapsed.as_secs_f64()).sum();
        busy - self.wall.as_secs_f64()
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for thread in &self.threads {
            writeln!(f, "{thread}")?;
        }
        writeln!(f, "Total")?;
        writeln!(f, "  wall time:  {:.6} s", self.wall.as_secs_f64())?;
        writeln!(f, "  overlap:    {:.6} s", self.overlap_secs())?;
        write!(f, "  throughput: {:.3} GOPS", self.total_gops())
    }
}

fn gops(ops: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    ops as f64 / secs / 1e9
}

/// Runs one worker on the calling thread
///
/// Acquires a context for `config.backend`, configures it once and times
/// `config.iterations` engine calls on a fresh workload.
pub fn run_single_thread(config: &BenchConfig) -> Result<ThreadReport> {
    config.validate()?;
    let plan = config.plan()?;
    run_worker(config, &plan, 0, None).map(|run| run.report)
}

/// Runs `config.threads` independent workers and waits for all of them
///
/// Setup and warm-up stay outside the wall clock: it spans only the timed
/// sections of the workers.
///
/// # Errors
///
/// The first worker error, in worker order. Every worker still runs to
/// completion or to its own first error.
#[cfg_attr(feature = "tracing", instrument(skip_all, fields(threads = config.threads)))]
pub fn run(config: &BenchConfig) -> Result<BenchReport> {
    config.validate()?;
    let plan = config.plan()?;
    let (threads, wall) = spawn_workers(config, &plan)?;
    Ok(BenchReport { threads, wall })
}

/// A worker's report with the bounds of its timed section
#[cfg_attr(not(feature = "parallel"), allow(dead_code))]
struct TimedRun {
    report: ThreadReport,
    start: Instant,
    end: Instant,
}

#[cfg(feature = "parallel")]
fn spawn_workers(
    config: &BenchConfig,
    plan: &TiledMatmul,
) -> Result<(Vec<ThreadReport>, Duration)> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .thread_name(|i| format!("tilemm-worker-{i}"))
        .build()
        .map_err(|e| {
            TileError::ResourceLimit(format!("cannot start worker threads: {e}"))
        })?;

    // Released once every worker has finished setup and warm-up.
    let ready = Barrier::new(config.threads);
    let runs = pool
        .broadcast(|worker| run_worker(config, plan, worker.index(), Some(&ready)))
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    let first_start = runs.iter().map(|run| run.start).min();
    let last_end = runs.iter().map(|run| run.end).max();
    let wall = match (first_start, last_end) {
        (Some(start), Some(end)) => end.duration_since(start),
        _ => Duration::ZERO,
    };
    Ok((runs.into_iter().map(|run| run.report).collect(), wall))
}

#[cfg(not(feature = "parallel"))]
fn spawn_workers(
    config: &BenchConfig,
    plan: &TiledMatmul,
) -> Result<(Vec<ThreadReport>, Duration)> {
    let results: Vec<_> = (0..config.threads)
        .map(|thread| run_worker(config, plan, thread, None))
        .collect();
    let runs = results.into_iter().collect::<Result<Vec<_>>>()?;

    // Workers run back to back, so only their timed sections add up.
    let wall = runs.iter().map(|run| run.report.elapsed).sum();
    Ok((runs.into_iter().map(|run| run.report).collect(), wall))
}

/// Context, configured palette and warmed-up workload of one worker
fn prepare_worker(
    config: &BenchConfig,
    plan: &TiledMatmul,
) -> Result<(TileContext<Box<dyn TileOps>>, BenchWorkload)> {
    let mut ctx = TileContext::acquire(backends::create(config.backend)?)?;
    plan.prepare(&mut ctx)?;
    let mut workload = BenchWorkload::new(plan, config.fill_a, config.fill_b);

    for _ in 0..config.warmup_iterations {
        plan.multiply(&mut ctx, &workload.a, &workload.b, &mut workload.c)?;
    }
    Ok((ctx, workload))
}

fn run_worker(
    config: &BenchConfig,
    plan: &TiledMatmul,
    thread: usize,
    ready: Option<&Barrier>,
) -> Result<TimedRun> {
    let prepared = prepare_worker(config, plan);
    // Every worker reaches the barrier, including one whose setup failed.
    if let Some(ready) = ready {
        ready.wait();
    }
    let (mut ctx, mut workload) = prepared?;

    let start = Instant::now();
    for _ in 0..config.iterations {
        plan.multiply(&mut ctx, &workload.a, &workload.b, &mut workload.c)?;
    }
    let end = Instant::now();
    let elapsed = end.duration_since(start);

    let backend = ctx.backend();
    ctx.release();

    #[cfg(feature = "tracing")]
    tracing::debug!(thread, elapsed = ?elapsed, "worker finished");

    Ok(TimedRun {
        report: ThreadReport {
            thread,
            backend,
            iterations: config.iterations,
            elapsed,
            ops: plan.ops_per_call() * config.iterations as u64,
            checksum: workload.checksum(),
            first_cell: workload.first_cell(),
        },
        start,
        end,
    })
}
