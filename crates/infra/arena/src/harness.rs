//! Multi-threaded allocation stress against a shared registry
//!
//! Workers share one pool of arena handles behind a read/write lock:
//! allocate and `free_all` run under the read side, destroy under the write
//! side, so no worker can reach an arena another worker already destroyed.
//! Stopping is cooperative through a polled flag.

use crate::arena::ArenaHandle;
use crate::config::HarnessConfig;
use crate::error::{ArenaError, ArenaResult};
use crate::registry::{ArenaRegistry, Stats};
use crate::report::StatisticsReporter;
use common::constants::harness::HISTOGRAM_SIGFIG;
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

// Chance that an allocation first opens a new arena while below max_arenas
const NEW_ARENA_PER_MILLE: u32 = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Worker lifecycle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle = 0,
    Allocating = 1,
    Stopped = 2,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Allocating,
            _ => Self::Stopped,
        }
    }
}

/// Cooperative stop flag shared with every worker
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask all workers to finish at their next safe point
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-worker outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub id: usize,
    pub ops: u64,
    pub allocations: u64,
    pub bytes_allocated: u64,
    pub out_of_memory: u64,
    pub frees: u64,
    pub destroys: u64,
    pub creates: u64,
    pub final_state: Option<WorkerState>,
}

/// Allocate latency percentiles in nanoseconds
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

/// Serializable overview of a run
#[derive(Debug, Clone, Serialize)]
pub struct HarnessSummary {
    pub workers: usize,
    pub ops: u64,
    pub allocations: u64,
    pub out_of_memory: u64,
    pub snapshots: u64,
    pub elapsed_ms: u128,
    pub before_cleanup: Stats,
    pub final_stats: Stats,
    pub latency: LatencySummary,
}

/// Outcome of [`ConcurrentAllocatorHarness::run`]
#[derive(Debug)]
pub struct HarnessReport {
    pub workers: Vec<WorkerReport>,
    /// Snapshot taken after all workers joined, before cleanup
    pub before_cleanup: Stats,
    /// Verified snapshot at the end of the run
    pub final_stats: Stats,
    /// Reporter snapshots taken during the run
    pub snapshots: u64,
    pub latency: Histogram<u64>,
    pub elapsed: Duration,
}

impl HarnessReport {
    pub fn total_ops(&self) -> u64 {
        self.workers.iter().map(|w| w.ops).sum()
    }

    pub fn total_allocations(&self) -> u64 {
        self.workers.iter().map(|w| w.allocations).sum()
    }

    pub fn total_out_of_memory(&self) -> u64 {
        self.workers.iter().map(|w| w.out_of_memory).sum()
    }

    pub fn latency_summary(&self) -> LatencySummary {
        if self.latency.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            samples: self.latency.len(),
            p50_ns: self.latency.value_at_percentile(50.0),
            p95_ns: self.latency.value_at_percentile(95.0),
            p99_ns: self.latency.value_at_percentile(99.0),
            max_ns: self.latency.max(),
        }
    }

    pub fn summary(&self) -> HarnessSummary {
        HarnessSummary {
            workers: self.workers.len(),
            ops: self.total_ops(),
            allocations: self.total_allocations(),
            out_of_memory: self.total_out_of_memory(),
            snapshots: self.snapshots,
            elapsed_ms: self.elapsed.as_millis(),
            before_cleanup: self.before_cleanup,
            final_stats: self.final_stats,
            latency: self.latency_summary(),
        }
    }
}

type Pool = Arc<RwLock<Vec<ArenaHandle>>>;

/// Drives randomized allocate/free/destroy cycles from several threads
pub struct ConcurrentAllocatorHarness {
    registry: Arc<ArenaRegistry>,
    config: HarnessConfig,
    stop: StopHandle,
}

impl ConcurrentAllocatorHarness {
    pub fn new(registry: Arc<ArenaRegistry>, config: HarnessConfig) -> ArenaResult<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            config,
            stop: StopHandle::default(),
        })
    }

    /// Handle for stopping a running harness from another thread.
    /// A stop ends the run in progress; the next `run` starts with the flag
    /// cleared.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run all workers to completion and return the verified outcome.
    ///
    /// `OutOfMemory` is counted and retried; any other error aborts the run.
    pub fn run(&self) -> ArenaResult<HarnessReport> {
        self.stop.reset();
        let started = Instant::now();
        let pool: Pool = Arc::new(RwLock::new(Vec::with_capacity(self.config.max_arenas)));
        let states: Arc<Vec<AtomicU8>> = Arc::new(
            (0..self.config.workers)
                .map(|_| AtomicU8::new(WorkerState::Idle as u8))
                .collect(),
        );
        let failure: Arc<Mutex<Option<ArenaError>>> = Arc::new(Mutex::new(None));
        let workers_done = Arc::new(AtomicBool::new(false));

        info!(
            workers = self.config.workers,
            ops_per_worker = ?self.config.ops_per_worker,
            duration_ms = ?self.config.duration_ms,
            "Starting allocation stress"
        );

        let reporter = {
            let registry = Arc::clone(&self.registry);
            let states = Arc::clone(&states);
            let failure = Arc::clone(&failure);
            let done = Arc::clone(&workers_done);
            let stop = self.stop.clone();
            let interval = self.config.report_interval();
            spawn_named("arena-reporter".to_string(), move || {
                report_loop(&registry, &states, interval, &done, &stop, &failure)
            })?
        };

        let mut handles = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                registry: Arc::clone(&self.registry),
                pool: Arc::clone(&pool),
                states: Arc::clone(&states),
                stop: self.stop.clone(),
                config: self.config.clone(),
                rng: StdRng::seed_from_u64(self.config.seed.wrapping_add(id as u64)),
                latency: new_histogram()?,
                report: WorkerReport {
                    id,
                    ..WorkerReport::default()
                },
            };
            let failure = Arc::clone(&failure);
            let stop = self.stop.clone();
            let spawned = spawn_named(format!("arena-worker-{id}"), move || {
                let result = worker.run();
                if let Err(err) = &result {
                    error!(worker = id, %err, "Worker aborted");
                    record_failure(&failure, err.clone());
                    stop.stop();
                }
                result
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    self.stop.stop();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    workers_done.store(true, Ordering::Release);
                    let _ = reporter.join();
                    return Err(err);
                }
            }
        }

        if let Some(limit) = self.config.duration() {
            let deadline = started + limit;
            while Instant::now() < deadline && !handles.iter().all(|h| h.is_finished()) {
                thread::sleep(POLL_INTERVAL);
            }
            self.stop.stop();
        }

        let mut workers = Vec::with_capacity(handles.len());
        let mut latency = new_histogram()?;
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok((report, histogram))) => {
                    latency
                        .add(&histogram)
                        .map_err(|e| ArenaError::InvariantViolation {
                            reason: format!("latency merge failed: {e:?}"),
                        })?;
                    workers.push(report);
                }
                Ok(Err(_)) => {}
                Err(_) => record_failure(
                    &failure,
                    ArenaError::InvariantViolation {
                        reason: format!("worker {id} panicked"),
                    },
                ),
            }
        }

        workers_done.store(true, Ordering::Release);
        let snapshots = match reporter.join() {
            Ok(snapshots) => snapshots,
            Err(_) => {
                record_failure(
                    &failure,
                    ArenaError::InvariantViolation {
                        reason: "reporter panicked".to_string(),
                    },
                );
                0
            }
        };

        if let Some(err) = failure.lock().take() {
            return Err(err);
        }

        let before_cleanup = self.registry.verify()?;
        if self.config.cleanup {
            for handle in pool.write().drain(..) {
                self.registry.destroy_arena(handle)?;
            }
        }
        let final_stats = self.registry.verify()?;

        let report = HarnessReport {
            workers,
            before_cleanup,
            final_stats,
            snapshots,
            latency,
            elapsed: started.elapsed(),
        };
        info!(
            ops = report.total_ops(),
            allocations = report.total_allocations(),
            oom = report.total_out_of_memory(),
            elapsed_ms = report.elapsed.as_millis(),
            "Allocation stress finished"
        );
        Ok(report)
    }
}

struct Worker {
    id: usize,
    registry: Arc<ArenaRegistry>,
    pool: Pool,
    states: Arc<Vec<AtomicU8>>,
    stop: StopHandle,
    config: HarnessConfig,
    rng: StdRng,
    latency: Histogram<u64>,
    report: WorkerReport,
}

impl Worker {
    fn run(mut self) -> ArenaResult<(WorkerReport, Histogram<u64>)> {
        let limit = self.config.ops_per_worker.unwrap_or(u64::MAX);
        while self.report.ops < limit && !self.stop.is_stopped() {
            self.set_state(WorkerState::Allocating);
            let step = self.step();
            self.set_state(WorkerState::Idle);
            step?;
            self.report.ops += 1;
        }
        self.set_state(WorkerState::Stopped);
        self.report.final_state = Some(WorkerState::Stopped);
        debug!(worker = self.id, ops = self.report.ops, "Worker stopped");
        Ok((self.report, self.latency))
    }

    fn set_state(&self, state: WorkerState) {
        self.states[self.id].store(state as u8, Ordering::Release);
    }

    fn step(&mut self) -> ArenaResult<()> {
        let roll = self.rng.gen_range(0..1000);
        if roll < self.config.destroy_per_mille {
            self.destroy_one()
        } else if roll < self.config.destroy_per_mille + self.config.free_all_per_mille {
            self.free_one()
        } else {
            self.allocate_one()
        }
    }

    fn allocate_one(&mut self) -> ArenaResult<()> {
        let wants_arena = {
            let pool = self.pool.read();
            pool.is_empty()
                || (pool.len() < self.config.max_arenas
                    && self.rng.gen_range(0..1000) < NEW_ARENA_PER_MILLE)
        };
        if wants_arena {
            self.create_one()?;
        }

        let pool = self.pool.read();
        let Some(&handle) = pool.choose(&mut self.rng) else {
            return Ok(());
        };
        let size = self
            .rng
            .gen_range(self.config.min_alloc..=self.config.max_alloc);

        let started = Instant::now();
        let result = self.registry.allocate(handle, size);
        // SAFETY: a single allocate never takes u64::MAX nanoseconds
        let _ = self.latency.record(started.elapsed().as_nanos() as u64);

        match result {
            Ok(_) => {
                self.report.allocations += 1;
                self.report.bytes_allocated += size;
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                self.report.out_of_memory += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn create_one(&mut self) -> ArenaResult<()> {
        let mut pool = self.pool.write();
        if pool.len() >= self.config.max_arenas {
            return Ok(());
        }
        match self.registry.new_arena(self.config.initial_reserve) {
            Ok(handle) => {
                pool.push(handle);
                self.report.creates += 1;
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                self.report.out_of_memory += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn free_one(&mut self) -> ArenaResult<()> {
        let pool = self.pool.read();
        if let Some(&handle) = pool.choose(&mut self.rng) {
            self.registry.free_all(handle)?;
            self.report.frees += 1;
        }
        Ok(())
    }

    fn destroy_one(&mut self) -> ArenaResult<()> {
        let mut pool = self.pool.write();
        if pool.is_empty() {
            return Ok(());
        }
        let index = self.rng.gen_range(0..pool.len());
        let handle = pool.swap_remove(index);
        self.registry.destroy_arena(handle)?;
        self.report.destroys += 1;
        Ok(())
    }
}

/// Reporter thread body; returns the number of snapshots taken
fn report_loop(
    registry: &ArenaRegistry,
    states: &[AtomicU8],
    interval: Duration,
    done: &AtomicBool,
    stop: &StopHandle,
    failure: &Mutex<Option<ArenaError>>,
) -> u64 {
    let reporter = StatisticsReporter::default();
    let mut previous = registry.snapshot();
    let mut snapshots = 0u64;
    let mut next = Instant::now() + interval;

    while !done.load(Ordering::Acquire) {
        if Instant::now() < next {
            thread::sleep(POLL_INTERVAL.min(interval));
            continue;
        }
        next += interval;

        let checked = registry.verify().and_then(|stats| {
            if stats.peak_committed < previous.peak_committed
                || stats.peak_count < previous.peak_count
            {
                Err(ArenaError::InvariantViolation {
                    reason: format!(
                        "peak went backwards: ({}, #{}) -> ({}, #{})",
                        previous.peak_committed,
                        previous.peak_count,
                        stats.peak_committed,
                        stats.peak_count
                    ),
                })
            } else {
                Ok(stats)
            }
        });

        match checked {
            Ok(stats) => {
                snapshots += 1;
                let allocating = states
                    .iter()
                    .filter(|s| {
                        WorkerState::from_u8(s.load(Ordering::Acquire)) == WorkerState::Allocating
                    })
                    .count();
                debug!(allocating, "{}", reporter.format(&stats));
                previous = stats;
            }
            Err(err) => {
                error!(%err, "Reporter check failed");
                record_failure(failure, err);
                stop.stop();
                break;
            }
        }
    }
    snapshots
}

/// Keep the first fatal error only
fn record_failure(failure: &Mutex<Option<ArenaError>>, err: ArenaError) {
    let mut slot = failure.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn new_histogram() -> ArenaResult<Histogram<u64>> {
    Histogram::<u64>::new(HISTOGRAM_SIGFIG).map_err(|e| ArenaError::InvalidConfig {
        reason: format!("histogram: {e:?}"),
    })
}

fn spawn_named<T, F>(name: String, body: F) -> ArenaResult<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| ArenaError::InvariantViolation {
            reason: format!("failed to spawn {name}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;

    fn harness(config: HarnessConfig) -> ConcurrentAllocatorHarness {
        let registry = ArenaRegistry::new(RegistryConfig {
            verify_invariants: true,
            ..RegistryConfig::default()
        })
        .unwrap();
        ConcurrentAllocatorHarness::new(Arc::new(registry), config).unwrap()
    }

    #[test]
    fn test_single_worker_is_deterministic() {
        let config = HarnessConfig {
            workers: 1,
            ops_per_worker: Some(500),
            cleanup: false,
            ..HarnessConfig::default()
        };
        let first = harness(config.clone()).run().unwrap();
        let second = harness(config).run().unwrap();

        assert_eq!(first.total_allocations(), second.total_allocations());
        assert_eq!(first.workers[0].bytes_allocated, second.workers[0].bytes_allocated);
        assert_eq!(first.final_stats, second.final_stats);
    }

    #[test]
    fn test_stop_handle_ends_unbounded_run() {
        let harness = harness(HarnessConfig {
            workers: 2,
            ops_per_worker: None,
            duration_ms: Some(60_000),
            ..HarnessConfig::default()
        });
        let stop = harness.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        });

        let report = harness.run().unwrap();
        stopper.join().unwrap();

        assert!(report.elapsed < Duration::from_secs(30));
        assert!(
            report
                .workers
                .iter()
                .all(|w| w.final_state == Some(WorkerState::Stopped))
        );
        assert_eq!(report.final_stats.live_count, 0);
    }

    #[test]
    fn test_run_after_stop_starts_fresh() {
        let harness = harness(HarnessConfig {
            workers: 2,
            ops_per_worker: Some(200),
            ..HarnessConfig::default()
        });
        harness.stop_handle().stop();

        let first = harness.run().unwrap();
        assert_eq!(first.total_ops(), 400);
        assert!(!harness.stop_handle().is_stopped());

        let second = harness.run().unwrap();
        assert_eq!(second.total_ops(), 400);
        assert_eq!(second.final_stats.live_count, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let registry = Arc::new(ArenaRegistry::default());
        let result = ConcurrentAllocatorHarness::new(
            registry,
            HarnessConfig {
                workers: 0,
                ..HarnessConfig::default()
            },
        );
        assert!(matches!(result, Err(ArenaError::InvalidConfig { .. })));
    }
}
