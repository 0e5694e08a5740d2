//! Property-based checks of registry accounting

use arena_tracker::{ArenaHandle, ArenaRegistry, GrowthPolicy, RegistryConfig};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create(u64),
    Allocate(usize, u64),
    FreeAll(usize),
    Destroy(usize),
    Purge,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0u64..8192).prop_map(Op::Create),
        6 => (any::<usize>(), 0u64..20_000).prop_map(|(i, size)| Op::Allocate(i, size)),
        1 => any::<usize>().prop_map(Op::FreeAll),
        1 => any::<usize>().prop_map(Op::Destroy),
        1 => Just(Op::Purge),
    ]
}

fn policy_strategy() -> impl Strategy<Value = GrowthPolicy> {
    prop_oneof![Just(GrowthPolicy::Automatic), Just(GrowthPolicy::FailFast)]
}

fn pick(handles: &[ArenaHandle], index: usize) -> Option<ArenaHandle> {
    if handles.is_empty() {
        None
    } else {
        Some(handles[index % handles.len()])
    }
}

proptest! {
    #[test]
    fn prop_aggregates_match_live_arenas(
        policy in policy_strategy(),
        limit in prop::option::of(16_384u64..262_144),
        ops in prop::collection::vec(op_strategy(), 1..120),
    ) {
        let registry = ArenaRegistry::new(RegistryConfig {
            growth_policy: policy,
            reserve_limit: limit,
            verify_invariants: false,
            ..RegistryConfig::default()
        }).unwrap();

        let mut handles: Vec<ArenaHandle> = Vec::new();
        let mut last = registry.snapshot();

        for op in ops {
            match op {
                Op::Create(reserve) => {
                    if let Ok(handle) = registry.new_arena(reserve) {
                        handles.push(handle);
                    }
                }
                Op::Allocate(i, size) => {
                    if let Some(handle) = pick(&handles, i) {
                        if let Err(err) = registry.allocate(handle, size) {
                            prop_assert!(err.is_retryable(), "unexpected {err}");
                        }
                    }
                }
                Op::FreeAll(i) => {
                    if let Some(handle) = pick(&handles, i) {
                        registry.free_all(handle).unwrap();
                    }
                }
                Op::Destroy(i) => {
                    if !handles.is_empty() {
                        let handle = handles.swap_remove(i % handles.len());
                        registry.destroy_arena(handle).unwrap();
                    }
                }
                Op::Purge => {
                    registry.purge().unwrap();
                }
            }

            let stats = registry.verify().unwrap();
            let mut committed = 0;
            let mut reserved = 0;
            for handle in &handles {
                let arena = registry.arena_stats(*handle).unwrap();
                prop_assert!(arena.committed <= arena.reserved);
                committed += arena.committed;
                reserved += arena.reserved;
            }
            prop_assert_eq!(stats.committed, committed);
            prop_assert_eq!(stats.reserved, reserved);
            prop_assert_eq!(stats.live_count, handles.len());
            if let Some(limit) = limit {
                prop_assert!(stats.reserved <= limit);
            }

            // Peaks never go backwards
            prop_assert!(stats.peak_committed >= last.peak_committed);
            prop_assert!(stats.peak_count >= last.peak_count);
            prop_assert!(stats.peak_committed >= stats.committed);
            last = stats;
        }
    }

    #[test]
    fn prop_round_trip_restores_aggregates(
        reserve in 0u64..1_000_000,
        sizes in prop::collection::vec(0u64..100_000, 0..20),
    ) {
        let registry = ArenaRegistry::default();
        let before = registry.snapshot();

        let handle = registry.new_arena(reserve).unwrap();
        for size in &sizes {
            registry.allocate(handle, *size).unwrap();
        }
        let arena = registry.destroy_arena(handle).unwrap();
        prop_assert_eq!(arena.committed, sizes.iter().sum::<u64>());

        let after = registry.snapshot();
        prop_assert_eq!(after.reserved, before.reserved);
        prop_assert_eq!(after.committed, before.committed);
        prop_assert_eq!(after.peak_committed, arena.peak_committed);
    }
}
