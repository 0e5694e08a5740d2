//! Common constants used across the workspace
//!
//! COMPLIANCE: Single source of truth for all magic numbers

/// Byte size constants
pub mod memory {
    /// Kilobyte in bytes
    pub const BYTES_PER_KB: u64 = 1024;
    /// Megabyte in bytes
    pub const BYTES_PER_MB: u64 = BYTES_PER_KB * 1024;
    /// Gigabyte in bytes
    pub const BYTES_PER_GB: u64 = BYTES_PER_MB * 1024;

    /// CPU cache line size (64 bytes for `x86_64`)
    pub const CACHE_LINE_SIZE: u64 = 64;

    /// Default reservation granularity. Must be a power of two.
    pub const DEFAULT_GRANULARITY: u64 = CACHE_LINE_SIZE;

    /// Default reservation growth multiplier on over-commit
    pub const DEFAULT_GROWTH_FACTOR: u64 = 2;
}

/// Stress harness defaults
pub mod harness {
    use std::time::Duration;

    /// Worker threads
    pub const DEFAULT_WORKERS: usize = 4;
    /// Operations per worker
    pub const DEFAULT_OPS_PER_WORKER: u64 = 10_000;
    /// Smallest randomized allocation
    pub const DEFAULT_MIN_ALLOC: u64 = 8;
    /// Largest randomized allocation
    pub const DEFAULT_MAX_ALLOC: u64 = 4 * super::memory::BYTES_PER_KB;
    /// Reservation for arenas created by workers
    pub const DEFAULT_INITIAL_RESERVE: u64 = 16 * super::memory::BYTES_PER_KB;
    /// Upper bound on arenas in the shared pool
    pub const DEFAULT_MAX_ARENAS: usize = 32;
    /// Chance of `free_all` per operation, in 1/1000
    pub const DEFAULT_FREE_ALL_PER_MILLE: u32 = 50;
    /// Chance of `destroy_arena` per operation, in 1/1000
    pub const DEFAULT_DESTROY_PER_MILLE: u32 = 10;
    /// Reporter snapshot interval
    pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(250);
    /// Default RNG seed
    pub const DEFAULT_SEED: u64 = 42;
    /// Significant figures kept by latency histograms
    pub const HISTOGRAM_SIGFIG: u8 = 3;
}
