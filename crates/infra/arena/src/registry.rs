//! Arena registry: ownership table plus aggregate accounting
//!
//! Every arena mutation and its aggregate delta happen under one lock, so a
//! snapshot never sees one without the other.

use crate::arena::{Allocation, Arena, ArenaHandle, ArenaStats, align_up, grown_reservation};
use crate::config::{GrowthPolicy, RegistryConfig};
use crate::error::{ArenaError, ArenaResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Point-in-time aggregate view of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Bytes reserved by live arenas
    pub reserved: u64,
    /// Bytes committed by live arenas
    pub committed: u64,
    /// Live arenas
    pub live_count: usize,
    /// Highest `committed` ever observed
    pub peak_committed: u64,
    /// Highest `live_count` ever observed
    pub peak_count: usize,
}

impl Stats {
    /// Committed bytes are at their historical maximum
    #[must_use]
    pub const fn is_at_peak(&self) -> bool {
        self.committed == self.peak_committed
    }
}

/// Lifetime counters, never reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryCounters {
    pub arenas_created: u64,
    pub arenas_destroyed: u64,
    pub reservation_growths: u64,
    pub out_of_memory: u64,
    pub purges: u64,
}

/// Outcome of [`ArenaRegistry::purge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PurgeSummary {
    /// Live arenas visited
    pub arenas: usize,
    /// Committed bytes released by the implicit `free_all`
    pub committed_freed: u64,
    /// Reserved bytes handed back
    pub reserved_released: u64,
}

struct Slot {
    generation: u32,
    arena: Option<Arena>,
}

#[derive(Default)]
struct RegistryState {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    reserved: u64,
    committed: u64,
    live: usize,
    peak_committed: u64,
    peak_count: usize,
    counters: RegistryCounters,
    /// First invariant violation seen; mutations are refused afterwards
    poisoned: Option<String>,
}

/// Owner of all arenas and their aggregate statistics
///
/// The registry is an ordinary value: create one per test or per process and
/// share it by reference or `Arc`.
///
/// Once a mutation trips an `InvariantViolation` the registry is poisoned:
/// later mutations return the same violation. Reads keep working and
/// [`ArenaRegistry::teardown`] still reclaims every arena, including one
/// created by the call that failed.
pub struct ArenaRegistry {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        Self {
            config: RegistryConfig::default(),
            state: Mutex::new(RegistryState::default()),
        }
    }
}

impl ArenaRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> ArenaResult<Self> {
        config.validate()?;
        debug!(
            granularity = config.granularity,
            policy = ?config.growth_policy,
            limit = ?config.reserve_limit,
            "Arena registry created"
        );
        Ok(Self {
            config,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create an arena reserving `reserve` bytes (rounded up to granularity)
    pub fn new_arena(&self, reserve: u64) -> ArenaResult<ArenaHandle> {
        self.mutate(|state, config| state.new_arena(reserve, config))
    }

    /// Commit `size` bytes in the arena
    pub fn allocate(&self, handle: ArenaHandle, size: u64) -> ArenaResult<Allocation> {
        self.mutate(|state, config| state.allocate(handle, size, config))
    }

    /// Reset the arena's committed bytes to zero, keeping its reservation
    pub fn free_all(&self, handle: ArenaHandle) -> ArenaResult<()> {
        self.mutate(|state, _| state.free_all(handle))
    }

    /// Remove the arena; returns its final counters
    pub fn destroy_arena(&self, handle: ArenaHandle) -> ArenaResult<ArenaStats> {
        self.mutate(|state, _| state.destroy(handle))
    }

    /// Free every arena and hand back all now-unused reservations
    pub fn purge(&self) -> ArenaResult<PurgeSummary> {
        self.mutate(|state, _| {
            let summary = state.purge();
            info!(
                arenas = summary.arenas,
                committed_freed = summary.committed_freed,
                reserved_released = summary.reserved_released,
                "Registry purged"
            );
            Ok(summary)
        })
    }

    /// Consistent aggregate snapshot
    pub fn snapshot(&self) -> Stats {
        self.state.lock().stats()
    }

    /// Recompute sums over live arenas and compare against the aggregates
    pub fn verify(&self) -> ArenaResult<Stats> {
        let state = self.state.lock();
        state.check()?;
        Ok(state.stats())
    }

    /// Counters for a single live arena
    pub fn arena_stats(&self, handle: ArenaHandle) -> ArenaResult<ArenaStats> {
        let state = self.state.lock();
        state.arena(handle).map(Arena::stats)
    }

    /// Whether `handle` refers to a live arena
    pub fn contains(&self, handle: ArenaHandle) -> bool {
        self.state.lock().arena(handle).is_ok()
    }

    /// Number of live arenas
    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    /// Handles of all live arenas in slot order
    pub fn live_handles(&self) -> Vec<ArenaHandle> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.arena.is_some())
            // Slot count is bounded by u32 at insertion
            .map(|(index, slot)| ArenaHandle::new(index as u32, slot.generation))
            .collect()
    }

    /// Lifetime counters
    pub fn counters(&self) -> RegistryCounters {
        self.state.lock().counters
    }

    /// Destroy every remaining arena and return the final snapshot.
    /// Arenas still live here are reported as leaks.
    pub fn teardown(self) -> Stats {
        let mut state = self.state.into_inner();
        let leaked: Vec<ArenaHandle> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.arena.is_some())
            // Slot count is bounded by u32 at insertion
            .map(|(index, slot)| ArenaHandle::new(index as u32, slot.generation))
            .collect();

        for handle in leaked {
            if let Ok(stats) = state.destroy(handle) {
                warn!(
                    %handle,
                    reserved = stats.reserved,
                    committed = stats.committed,
                    "Arena still live at teardown"
                );
            }
        }

        let stats = state.stats();
        info!(
            peak_committed = stats.peak_committed,
            peak_count = stats.peak_count,
            created = state.counters.arenas_created,
            "Arena registry torn down"
        );
        stats
    }

    /// Run one mutation under the lock, then the bookkeeping shared by every
    /// entry point
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut RegistryState, &RegistryConfig) -> ArenaResult<T>,
    ) -> ArenaResult<T> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.poisoned {
            return Err(ArenaError::InvariantViolation {
                reason: reason.clone(),
            });
        }

        let result = op(&mut *state, &self.config);
        if let Err(ArenaError::OutOfMemory {
            requested,
            available,
        }) = &result
        {
            state.counters.out_of_memory += 1;
            warn!(requested, available, "Arena allocation rejected");
        }
        if self.config.verify_invariants {
            if let Err(err) = state.check() {
                if let ArenaError::InvariantViolation { reason } = &err {
                    state.poisoned = Some(reason.clone());
                }
                return Err(err);
            }
        }
        result
    }
}

impl RegistryState {
    fn stats(&self) -> Stats {
        Stats {
            reserved: self.reserved,
            committed: self.committed,
            live_count: self.live,
            peak_committed: self.peak_committed,
            peak_count: self.peak_count,
        }
    }

    fn arena(&self, handle: ArenaHandle) -> ArenaResult<&Arena> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.arena.as_ref())
            .ok_or(ArenaError::UnknownArena { handle })
    }

    fn arena_mut(slots: &mut [Slot], handle: ArenaHandle) -> ArenaResult<&mut Arena> {
        slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.arena.as_mut())
            .ok_or(ArenaError::UnknownArena { handle })
    }

    /// Bytes that may still be reserved before the limit, or before the
    /// total would overflow when no limit is set
    fn limit_headroom(&self, config: &RegistryConfig) -> u64 {
        config
            .reserve_limit
            .unwrap_or(u64::MAX)
            .saturating_sub(self.reserved)
    }

    fn new_arena(&mut self, reserve: u64, config: &RegistryConfig) -> ArenaResult<ArenaHandle> {
        let headroom = self.limit_headroom(config);
        let reserved = align_up(reserve, config.granularity)
            .filter(|reserved| *reserved <= headroom)
            .ok_or(ArenaError::OutOfMemory {
                requested: reserve,
                available: headroom,
            })?;
        let total = self
            .reserved
            .checked_add(reserved)
            .ok_or(ArenaError::OutOfMemory {
                requested: reserve,
                available: u64::MAX - self.reserved,
            })?;

        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    ArenaError::OutOfMemory {
                        requested: reserve,
                        available: 0,
                    }
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    arena: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.arena = Some(Arena::new(reserved));
        let handle = ArenaHandle::new(index, slot.generation);

        self.reserved = total;
        self.live += 1;
        self.peak_count = self.peak_count.max(self.live);
        self.counters.arenas_created += 1;

        debug!(%handle, reserved, live = self.live, "Arena created");
        Ok(handle)
    }

    fn allocate(
        &mut self,
        handle: ArenaHandle,
        size: u64,
        config: &RegistryConfig,
    ) -> ArenaResult<Allocation> {
        let limit_headroom = self.limit_headroom(config);
        let arena = Self::arena_mut(&mut self.slots, handle)?;

        let needed = arena.commit_target(size).ok_or(ArenaError::OutOfMemory {
            requested: size,
            available: arena.headroom(),
        })?;
        let committed = self
            .committed
            .checked_add(size)
            .ok_or(ArenaError::OutOfMemory {
                requested: size,
                available: arena.headroom(),
            })?;

        if needed > arena.reserved() {
            let current = arena.reserved();
            let target = match config.growth_policy {
                // Near the limit, settle for exactly what is needed
                GrowthPolicy::Automatic => grown_reservation(
                    current,
                    needed,
                    arena.initial_reserve(),
                    config.granularity,
                    config.growth_factor,
                )
                .map(|target| {
                    if target - current > limit_headroom {
                        align_up(needed, config.granularity).unwrap_or(target)
                    } else {
                        target
                    }
                }),
                // A purged arena may take its initial reservation back
                GrowthPolicy::FailFast if current == 0 => {
                    Some(arena.initial_reserve()).filter(|initial| *initial >= needed)
                }
                GrowthPolicy::FailFast => None,
            };

            let target = target
                .filter(|target| target - current <= limit_headroom)
                .ok_or(ArenaError::OutOfMemory {
                    requested: size,
                    available: arena.headroom(),
                })?;
            let total = self
                .reserved
                .checked_add(target - current)
                .ok_or(ArenaError::OutOfMemory {
                    requested: size,
                    available: u64::MAX - self.reserved,
                })?;

            arena.grow_to(target);
            self.reserved = total;
            self.counters.reservation_growths += 1;
            debug!(%handle, from = current, to = target, "Arena reservation grew");
        }

        let allocation = arena.commit(size);
        self.committed = committed;
        self.peak_committed = self.peak_committed.max(self.committed);
        Ok(allocation)
    }

    fn free_all(&mut self, handle: ArenaHandle) -> ArenaResult<()> {
        let arena = Self::arena_mut(&mut self.slots, handle)?;
        let released = arena.free_all();
        self.committed -= released;
        debug!(%handle, released, "Arena freed");
        Ok(())
    }

    fn destroy(&mut self, handle: ArenaHandle) -> ArenaResult<ArenaStats> {
        // Validate first so a stale handle leaves the slot untouched
        Self::arena_mut(&mut self.slots, handle)?;

        let slot = &mut self.slots[handle.index() as usize];
        let arena = slot.arena.take().ok_or(ArenaError::UnknownArena { handle })?;
        let stats = arena.stats();

        // A slot whose generation would wrap is retired instead of reused
        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free_slots.push(handle.index());
            }
            None => slot.generation = u32::MAX,
        }

        self.committed -= stats.committed;
        self.reserved -= stats.reserved;
        self.live -= 1;
        self.counters.arenas_destroyed += 1;

        debug!(
            %handle,
            reserved = stats.reserved,
            committed = stats.committed,
            peak = stats.peak_committed,
            "Arena destroyed"
        );
        Ok(stats)
    }

    fn purge(&mut self) -> PurgeSummary {
        let mut summary = PurgeSummary::default();
        for arena in self.slots.iter_mut().filter_map(|slot| slot.arena.as_mut()) {
            summary.arenas += 1;
            summary.committed_freed += arena.free_all();
            summary.reserved_released += arena.release_reservation();
        }
        self.committed -= summary.committed_freed;
        self.reserved -= summary.reserved_released;
        self.counters.purges += 1;
        summary
    }

    fn check(&self) -> ArenaResult<()> {
        // Wide sums so a corrupted total is reported rather than overflowing
        let (mut reserved, mut committed, mut live) = (0u128, 0u128, 0usize);
        for arena in self.slots.iter().filter_map(|slot| slot.arena.as_ref()) {
            if arena.committed() > arena.reserved() {
                return Err(violation(format!(
                    "arena committed {} exceeds reserved {}",
                    arena.committed(),
                    arena.reserved()
                )));
            }
            reserved += u128::from(arena.reserved());
            committed += u128::from(arena.committed());
            live += 1;
        }

        if committed != u128::from(self.committed) {
            return Err(violation(format!(
                "committed total {} != live sum {committed}",
                self.committed
            )));
        }
        if reserved != u128::from(self.reserved) {
            return Err(violation(format!(
                "reserved total {} != live sum {reserved}",
                self.reserved
            )));
        }
        if live != self.live {
            return Err(violation(format!(
                "live count {} != live slots {live}",
                self.live
            )));
        }
        if self.peak_committed < self.committed || self.peak_count < self.live {
            return Err(violation(format!(
                "peak ({}, #{}) below current ({}, #{})",
                self.peak_committed, self.peak_count, self.committed, self.live
            )));
        }
        Ok(())
    }
}

fn violation(reason: String) -> ArenaError {
    error!(%reason, "Arena registry invariant violated");
    ArenaError::InvariantViolation { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::constants::memory::BYTES_PER_KB;

    fn registry(policy: GrowthPolicy) -> ArenaRegistry {
        ArenaRegistry::new(RegistryConfig {
            growth_policy: policy,
            verify_invariants: true,
            ..RegistryConfig::default()
        })
        .expect("valid config")
    }

    #[test]
    fn test_new_arena_rounds_reservation() {
        let registry = registry(GrowthPolicy::Automatic);
        let handle = registry.new_arena(100).unwrap();
        assert_eq!(registry.arena_stats(handle).unwrap().reserved, 128);
        assert_eq!(registry.snapshot().reserved, 128);
    }

    #[test]
    fn test_automatic_growth_tracked() {
        let registry = registry(GrowthPolicy::Automatic);
        let handle = registry.new_arena(BYTES_PER_KB).unwrap();

        registry.allocate(handle, 1000).unwrap();
        let alloc = registry.allocate(handle, 100).unwrap();
        assert_eq!(alloc.offset, 1000);

        let stats = registry.arena_stats(handle).unwrap();
        assert_eq!(stats.reserved, 2 * BYTES_PER_KB);
        assert_eq!(stats.growth_count, 1);
        assert_eq!(registry.counters().reservation_growths, 1);
        assert_eq!(registry.snapshot().reserved, 2 * BYTES_PER_KB);
    }

    #[test]
    fn test_fail_fast_leaves_arena_unchanged() {
        let registry = registry(GrowthPolicy::FailFast);
        let handle = registry.new_arena(BYTES_PER_KB).unwrap();
        registry.allocate(handle, 1000).unwrap();

        let err = registry.allocate(handle, 100).unwrap_err();
        assert_eq!(
            err,
            ArenaError::OutOfMemory {
                requested: 100,
                available: 24
            }
        );
        assert!(err.is_retryable());

        let stats = registry.arena_stats(handle).unwrap();
        assert_eq!(stats.committed, 1000);
        assert_eq!(stats.reserved, BYTES_PER_KB);
        assert_eq!(registry.counters().out_of_memory, 1);

        // Still usable
        registry.allocate(handle, 24).unwrap();
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let registry = registry(GrowthPolicy::Automatic);
        let old = registry.new_arena(64).unwrap();
        registry.destroy_arena(old).unwrap();

        let new = registry.new_arena(64).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert_eq!(
            registry.allocate(old, 1),
            Err(ArenaError::UnknownArena { handle: old })
        );
        assert_eq!(
            registry.destroy_arena(old),
            Err(ArenaError::UnknownArena { handle: old })
        );
        assert!(registry.contains(new));
        assert_eq!(registry.live_handles(), vec![new]);
    }

    #[test]
    fn test_zero_size_allocation_is_noop() {
        let registry = registry(GrowthPolicy::FailFast);
        let handle = registry.new_arena(0).unwrap();
        let alloc = registry.allocate(handle, 0).unwrap();
        assert_eq!(alloc, Allocation { offset: 0, size: 0 });
        assert_eq!(registry.snapshot(), Stats {
            reserved: 0,
            committed: 0,
            live_count: 1,
            peak_committed: 0,
            peak_count: 1,
        });
    }

    #[test]
    fn test_reserve_limit_rejects_creation_and_growth() {
        let registry = ArenaRegistry::new(RegistryConfig {
            reserve_limit: Some(2 * BYTES_PER_KB),
            verify_invariants: true,
            ..RegistryConfig::default()
        })
        .unwrap();

        let handle = registry.new_arena(BYTES_PER_KB).unwrap();
        assert!(matches!(
            registry.new_arena(2 * BYTES_PER_KB),
            Err(ArenaError::OutOfMemory { .. })
        ));

        // Doubling to 2KB fits exactly
        registry.allocate(handle, 1500).unwrap();
        // Growing to 4KB does not
        assert!(matches!(
            registry.allocate(handle, 1000),
            Err(ArenaError::OutOfMemory { .. })
        ));
        assert_eq!(registry.snapshot().reserved, 2 * BYTES_PER_KB);
        assert_eq!(registry.snapshot().committed, 1500);
    }

    #[test]
    fn test_growth_near_limit_falls_back_to_exact_fit() {
        let registry = ArenaRegistry::new(RegistryConfig {
            reserve_limit: Some(3 * BYTES_PER_KB),
            verify_invariants: true,
            ..RegistryConfig::default()
        })
        .unwrap();

        let handle = registry.new_arena(BYTES_PER_KB).unwrap();
        registry.allocate(handle, 1500).unwrap();
        registry.allocate(handle, 1000).unwrap();

        // 4KB would break the limit, 2560 does not
        assert_eq!(registry.arena_stats(handle).unwrap().reserved, 2560);
        assert_eq!(registry.counters().reservation_growths, 2);
    }

    #[test]
    fn test_purge_releases_reservation_keeps_peak() {
        let registry = registry(GrowthPolicy::Automatic);
        let a = registry.new_arena(BYTES_PER_KB).unwrap();
        let b = registry.new_arena(BYTES_PER_KB).unwrap();
        registry.allocate(a, 512).unwrap();
        registry.allocate(b, 256).unwrap();

        let summary = registry.purge().unwrap();
        assert_eq!(summary, PurgeSummary {
            arenas: 2,
            committed_freed: 768,
            reserved_released: 2 * BYTES_PER_KB,
        });

        let stats = registry.snapshot();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.live_count, 2);
        assert_eq!(stats.peak_committed, 768);

        // A purged arena re-reserves on next use
        registry.allocate(a, 10).unwrap();
        assert_eq!(registry.arena_stats(a).unwrap().reserved, BYTES_PER_KB);
    }

    #[test]
    fn test_fail_fast_purged_arena_takes_initial_reservation_back() {
        let registry = registry(GrowthPolicy::FailFast);
        let handle = registry.new_arena(BYTES_PER_KB).unwrap();
        registry.purge().unwrap();

        registry.allocate(handle, BYTES_PER_KB).unwrap();
        assert_eq!(registry.snapshot().reserved, BYTES_PER_KB);
        assert!(registry.allocate(handle, 1).is_err());
    }

    #[test]
    fn test_teardown_destroys_leaked_arenas() {
        let registry = registry(GrowthPolicy::Automatic);
        let handle = registry.new_arena(BYTES_PER_KB).unwrap();
        registry.allocate(handle, 700).unwrap();
        registry.new_arena(BYTES_PER_KB).unwrap();

        let stats = registry.teardown();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.live_count, 0);
        assert_eq!(stats.peak_committed, 700);
        assert_eq!(stats.peak_count, 2);
    }

    #[test]
    fn test_invariant_violation_poisons_registry() {
        let registry = registry(GrowthPolicy::Automatic);
        let first = registry.new_arena(BYTES_PER_KB).unwrap();
        registry.state.lock().committed += 1;

        assert!(matches!(
            registry.new_arena(BYTES_PER_KB),
            Err(ArenaError::InvariantViolation { .. })
        ));
        // The arena made by the failing call is still tracked
        assert_eq!(registry.live_handles().len(), 2);
        assert_eq!(registry.live_count(), 2);

        assert!(matches!(
            registry.allocate(first, 1),
            Err(ArenaError::InvariantViolation { .. })
        ));
        assert!(matches!(
            registry.destroy_arena(first),
            Err(ArenaError::InvariantViolation { .. })
        ));
        assert!(matches!(
            registry.purge(),
            Err(ArenaError::InvariantViolation { .. })
        ));
        assert_eq!(registry.arena_stats(first).unwrap().committed, 0);

        let stats = registry.teardown();
        assert_eq!(stats.live_count, 0);
        assert_eq!(stats.reserved, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ArenaRegistry::new(RegistryConfig {
            granularity: 3,
            ..RegistryConfig::default()
        });
        assert!(matches!(result, Err(ArenaError::InvalidConfig { .. })));
    }
}
