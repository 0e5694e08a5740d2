//! Registry and stress harness configuration

use crate::error::{ArenaError, ArenaResult};
use common::constants::{harness, memory};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// What an arena does when an allocation overruns its reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// Grow the reservation and record the growth
    #[default]
    Automatic,
    /// Reject the allocation with `OutOfMemory`
    FailFast,
}

impl FromStr for GrowthPolicy {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "automatic" | "auto" => Ok(Self::Automatic),
            "fail_fast" | "failfast" => Ok(Self::FailFast),
            other => Err(ArenaError::InvalidConfig {
                reason: format!("unknown growth policy '{other}'"),
            }),
        }
    }
}

/// Arena registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Reservations are rounded up to a multiple of this (power of two)
    pub granularity: u64,

    /// Over-commit behaviour
    pub growth_policy: GrowthPolicy,

    /// Reservation multiplier applied on automatic growth
    pub growth_factor: u64,

    /// Cap on total reserved bytes across all live arenas
    pub reserve_limit: Option<u64>,

    /// Recheck aggregate sums after every mutation
    pub verify_invariants: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            granularity: memory::DEFAULT_GRANULARITY,
            growth_policy: GrowthPolicy::Automatic,
            growth_factor: memory::DEFAULT_GROWTH_FACTOR,
            reserve_limit: None,
            verify_invariants: cfg!(debug_assertions),
        }
    }
}

impl RegistryConfig {
    /// Validate configuration values
    pub fn validate(&self) -> ArenaResult<()> {
        if !self.granularity.is_power_of_two() {
            return Err(ArenaError::InvalidConfig {
                reason: format!("granularity {} is not a power of two", self.granularity),
            });
        }
        if self.growth_factor == 0 {
            return Err(ArenaError::InvalidConfig {
                reason: "growth_factor must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Concurrent stress harness configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Worker threads
    pub workers: usize,

    /// Operations per worker; `None` runs until the duration elapses
    pub ops_per_worker: Option<u64>,

    /// Wall-clock limit in milliseconds
    pub duration_ms: Option<u64>,

    /// Allocation size bounds (inclusive)
    pub min_alloc: u64,
    pub max_alloc: u64,

    /// Reservation for arenas created by workers
    pub initial_reserve: u64,

    /// Upper bound on arenas in the shared pool
    pub max_arenas: usize,

    /// Per-operation chance of `free_all`, in 1/1000
    pub free_all_per_mille: u32,

    /// Per-operation chance of `destroy_arena`, in 1/1000
    pub destroy_per_mille: u32,

    /// Reporter snapshot interval in milliseconds
    pub report_interval_ms: u64,

    /// Base RNG seed; worker `i` uses `seed + i`
    pub seed: u64,

    /// Destroy the remaining pool after the run
    pub cleanup: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workers: harness::DEFAULT_WORKERS,
            ops_per_worker: Some(harness::DEFAULT_OPS_PER_WORKER),
            duration_ms: None,
            min_alloc: harness::DEFAULT_MIN_ALLOC,
            max_alloc: harness::DEFAULT_MAX_ALLOC,
            initial_reserve: harness::DEFAULT_INITIAL_RESERVE,
            max_arenas: harness::DEFAULT_MAX_ARENAS,
            free_all_per_mille: harness::DEFAULT_FREE_ALL_PER_MILLE,
            destroy_per_mille: harness::DEFAULT_DESTROY_PER_MILLE,
            // SAFETY: interval is a small constant
            report_interval_ms: harness::DEFAULT_REPORT_INTERVAL.as_millis() as u64,
            seed: harness::DEFAULT_SEED,
            cleanup: true,
        }
    }
}

impl HarnessConfig {
    /// Wall-clock limit, if any
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    /// Reporter snapshot interval
    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }

    /// Validate configuration values
    pub fn validate(&self) -> ArenaResult<()> {
        let invalid = |reason: &str| {
            Err(ArenaError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.ops_per_worker.is_none() && self.duration_ms.is_none() {
            return invalid("either ops_per_worker or duration_ms must be set");
        }
        if self.min_alloc > self.max_alloc {
            return invalid("min_alloc exceeds max_alloc");
        }
        if self.max_arenas == 0 {
            return invalid("max_arenas must be at least 1");
        }
        if self.free_all_per_mille + self.destroy_per_mille > 1000 {
            return invalid("free_all_per_mille + destroy_per_mille exceeds 1000");
        }
        Ok(())
    }
}
