//! Arena tracker stress and reporting tool

#![allow(clippy::print_stdout)] // This is a CLI tool that needs to print output
#![allow(clippy::uninlined_format_args)] // Format args are fine for CLI output
#![allow(clippy::cast_precision_loss)] // Acceptable for throughput calculations

use anyhow::{Context, Result};
use arena_tracker::{
    ArenaRegistry, ConcurrentAllocatorHarness, HarnessConfig, HarnessReport, RegistryConfig,
    StatisticsReporter, Stats,
};
use clap::{Parser, Subcommand};
use common::Scale;
use common::constants::memory::{BYTES_PER_GB, BYTES_PER_KB, BYTES_PER_MB};
use hdrhistogram::Histogram;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
use config::load_config;

#[derive(Parser, Debug)]
#[command(name = "arena-perf", about = "Arena tracker stress and report tool")]
struct Cli {
    #[arg(long, default_value = "info")]
    log: String,
    /// JSON config file; falls back to $ARENA_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the concurrent allocation harness and report aggregate statistics
    Stress {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        ops: Option<u64>,
        /// Stop after this many milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Report scale: b, k, m or g
        #[arg(long, default_value = "k")]
        scale: Scale,
        /// Leave arenas alive and list them before teardown
        #[arg(long)]
        keep_arenas: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the reference report scenarios
    Scenario,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log))
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Cmd::Stress {
            workers,
            ops,
            duration_ms,
            seed,
            scale,
            keep_arenas,
            json,
        } => {
            let mut harness = config.harness;
            if let Some(workers) = workers {
                harness.workers = workers;
            }
            if ops.is_some() || duration_ms.is_some() {
                harness.ops_per_worker = ops;
                harness.duration_ms = duration_ms;
            }
            if let Some(seed) = seed {
                harness.seed = seed;
            }
            harness.cleanup = !keep_arenas;
            cmd_stress(config.registry, harness, scale, json)
        }
        Cmd::Scenario => cmd_scenario(config.registry),
    }
}

fn cmd_stress(
    registry_config: RegistryConfig,
    harness_config: HarnessConfig,
    scale: Scale,
    json: bool,
) -> Result<()> {
    let registry = Arc::new(ArenaRegistry::new(registry_config).context("create registry")?);
    let harness = ConcurrentAllocatorHarness::new(Arc::clone(&registry), harness_config)
        .context("create harness")?;

    let baseline = registry.snapshot();
    let report = harness.run().context("stress run")?;
    drop(harness);

    let reporter = StatisticsReporter::new(scale);
    if json {
        println!("{}", serde_json::to_string_pretty(&report.summary())?);
    } else {
        print_stress(&reporter, &baseline, &report);
    }

    for handle in registry.live_handles() {
        let stats = registry.arena_stats(handle)?;
        info!("{}", reporter.format_arena(handle, &stats));
    }

    let counters = registry.counters();
    info!(
        "Registry: created={} destroyed={} growths={} oom={} purges={}",
        counters.arenas_created,
        counters.arenas_destroyed,
        counters.reservation_growths,
        counters.out_of_memory,
        counters.purges
    );

    match Arc::try_unwrap(registry) {
        Ok(registry) => {
            let last = registry.teardown();
            info!("\n{}", reporter.format(&last));
        }
        Err(_) => warn!("Registry still shared, skipping teardown"),
    }
    Ok(())
}

fn print_stress(reporter: &StatisticsReporter, baseline: &Stats, report: &HarnessReport) {
    let secs = report.elapsed.as_secs_f64();
    let ops = report.total_ops();

    info!("\n=== STRESS RUN ===");
    info!("Workers: {}", report.workers.len());
    info!("Operations: {}", ops);
    info!("Allocations: {}", report.total_allocations());
    info!("Out of memory (retried): {}", report.total_out_of_memory());
    info!("Reporter snapshots: {}", report.snapshots);
    info!("Time: {:.3}s", secs);
    if secs > 0.0 {
        info!("Throughput: {:.0} ops/sec", ops as f64 / secs);
    }

    info!("\n--- Per worker ---");
    for w in &report.workers {
        info!(
            "  worker {}: ops={} alloc={} ({} bytes) oom={} free_all={} create={} destroy={} state={:?}",
            w.id,
            w.ops,
            w.allocations,
            w.bytes_allocated,
            w.out_of_memory,
            w.frees,
            w.creates,
            w.destroys,
            w.final_state
        );
    }

    info!("\n--- Before cleanup ---\n{}", reporter.format(&report.before_cleanup));
    info!(
        "\n--- Final (vs start) ---\n{}",
        reporter.format_diff(baseline, &report.final_stats)
    );
    print_hist("Allocate latency", &report.latency);
    info!("Invariants: ✅ PASS");
}

fn cmd_scenario(registry_config: RegistryConfig) -> Result<()> {
    info!("\n=== SCENARIO: two 1KB arenas ===");
    let registry = ArenaRegistry::new(registry_config.clone())?;
    let first = registry.new_arena(BYTES_PER_KB)?;
    let second = registry.new_arena(BYTES_PER_KB)?;
    registry.allocate(first, BYTES_PER_KB)?;
    registry.allocate(second, BYTES_PER_KB)?;
    info!("\n{}", StatisticsReporter::new(Scale::Kilo).format(&registry.snapshot()));
    registry.teardown();

    info!("\n=== SCENARIO: 2GB arena destroyed ===");
    let registry = ArenaRegistry::new(registry_config)?;
    let big = registry.new_arena(BYTES_PER_KB)?;
    let small = registry.new_arena(BYTES_PER_KB)?;
    let step = 64 * BYTES_PER_MB;
    for _ in 0..(2 * BYTES_PER_GB / step) {
        registry.allocate(big, step)?;
    }
    let reporter = StatisticsReporter::new(Scale::Giga);
    info!("\n{}", reporter.format(&registry.snapshot()));
    registry.destroy_arena(big)?;
    registry.destroy_arena(small)?;
    info!("\n{}", reporter.format(&registry.snapshot()));
    registry.teardown();

    Ok(())
}

fn print_hist(name: &str, h: &Histogram<u64>) {
    if h.is_empty() {
        info!("{}: No data", name);
        return;
    }

    let p50 = h.value_at_percentile(50.0);
    let p95 = h.value_at_percentile(95.0);
    let p99 = h.value_at_percentile(99.0);
    let p999 = h.value_at_percentile(99.9);
    let max = h.max();

    info!(
        "{}: p50={}ns p95={}ns p99={}ns p99.9={}ns max={}ns",
        name, p50, p95, p99, p999, max
    );
}
