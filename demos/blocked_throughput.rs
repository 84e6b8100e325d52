//! Two-thread blocked throughput benchmark
//!
//! Each thread keeps a 2×2 block of accumulator tiles resident over 16
//! reduction steps (a 32×32 output with K = 1024) and reports its own
//! throughput; the totals use wall-clock time.
//!
//! Run with: cargo run --release --example blocked_throughput [iterations]

use tilemm::{AccumulatorPolicy, BenchConfig, Result, TileError};

fn main() -> Result<()> {
    let iterations = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .map_err(|_| TileError::InvalidInput(format!("not an iteration count: {arg}")))?,
        None => 100_000,
    };

    for policy in [
        AccumulatorPolicy::Resident,
        AccumulatorPolicy::StoreEachStep,
    ] {
        let config = BenchConfig::blocked(16)
            .with_iterations(iterations)
            .with_warmup(iterations / 100)
            .with_policy(policy);
        let plan = config.plan()?;

        println!("══ {policy:?} accumulators ══");
        println!(
            "per call: {} ops, {}",
            plan.ops_per_call(),
            plan.tile_traffic()
        );
        println!("{}\n", tilemm::bench::run(&config)?);
    }
    Ok(())
}
