//! Arena memory tracker
//!
//! Bump-style arenas with reserved/committed accounting, owned by an
//! [`ArenaRegistry`] that keeps consistent aggregate and peak statistics,
//! plus a [`StatisticsReporter`] and a multi-threaded stress harness.
//!
//! ```
//! use arena_tracker::{ArenaRegistry, RegistryConfig, report};
//! use common::Scale;
//!
//! let registry = ArenaRegistry::new(RegistryConfig::default())?;
//! let a = registry.new_arena(1024)?;
//! let b = registry.new_arena(1024)?;
//! registry.allocate(a, 1024)?;
//! registry.allocate(b, 1024)?;
//!
//! let text = report::format(&registry.snapshot(), Scale::Kilo);
//! assert!(text.contains("reserved=2KB, committed=2KB"));
//! assert!(text.contains("(arena=2KB #2) (at peak)"));
//! # Ok::<(), arena_tracker::ArenaError>(())
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod harness;
pub mod registry;
pub mod report;

pub use arena::{Allocation, ArenaHandle, ArenaStats};
pub use config::{GrowthPolicy, HarnessConfig, RegistryConfig};
pub use error::{ArenaError, ArenaResult};
pub use harness::{
    ConcurrentAllocatorHarness, HarnessReport, HarnessSummary, LatencySummary, StopHandle,
    WorkerReport, WorkerState,
};
pub use registry::{ArenaRegistry, PurgeSummary, RegistryCounters, Stats};
pub use report::StatisticsReporter;
