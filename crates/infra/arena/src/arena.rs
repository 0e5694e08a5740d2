//! Bump-style arena with reserve/commit accounting
//!
//! COMPLIANCE:
//! - Reservations rounded to granularity
//! - Committed bytes never exceed the reservation
//! - Peak retained until destruction
//! - Generation-tagged handles, no dangling references

use serde::{Deserialize, Serialize};
use std::fmt;

// Tagged handle layout: 32-bit generation in the upper half, slot index below
const TAG_BITS: u32 = 32;
const INDEX_MASK: u64 = 0xFFFF_FFFF;

/// Opaque reference to an arena owned by a registry
///
/// A slot's generation is bumped on destroy, so a stale handle never aliases
/// a newer arena that reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArenaHandle {
    index: u32,
    generation: u32,
}

impl ArenaHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the registry table
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at creation time
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a single `u64`
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.generation as u64) << TAG_BITS) | self.index as u64
    }

    /// Unpack a value produced by [`ArenaHandle::as_u64`]
    #[inline]
    #[must_use]
    pub const fn from_u64(packed: u64) -> Self {
        // Both halves fit in 32 bits after the mask and shift
        Self {
            index: (packed & INDEX_MASK) as u32,
            generation: (packed >> TAG_BITS) as u32,
        }
    }
}

impl fmt::Display for ArenaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena#{}.{}", self.index, self.generation)
    }
}

/// Span handed out by a successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Offset from the start of the arena's reservation
    pub offset: u64,
    /// Bytes committed by this allocation
    pub size: u64,
}

/// Per-arena counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArenaStats {
    pub reserved: u64,
    pub committed: u64,
    pub peak_committed: u64,
    /// Times the reservation grew to absorb an over-commit
    pub growth_count: u64,
    /// Successful non-empty allocations since creation
    pub allocation_count: u64,
}

/// Round `value` up to a multiple of `granularity` (a power of two).
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub fn align_up(value: u64, granularity: u64) -> Option<u64> {
    debug_assert!(granularity.is_power_of_two());
    let mask = granularity - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Arena state. Only reachable through the registry, which applies the
/// matching aggregate deltas under the same lock.
#[derive(Debug)]
pub(crate) struct Arena {
    reserved: u64,
    committed: u64,
    peak_committed: u64,
    initial_reserve: u64,
    growth_count: u64,
    allocation_count: u64,
}

impl Arena {
    /// `reserved` is already rounded to granularity
    pub(crate) const fn new(reserved: u64) -> Self {
        Self {
            reserved,
            committed: 0,
            peak_committed: 0,
            initial_reserve: reserved,
            growth_count: 0,
            allocation_count: 0,
        }
    }

    #[inline]
    pub(crate) const fn reserved(&self) -> u64 {
        self.reserved
    }

    #[inline]
    pub(crate) const fn committed(&self) -> u64 {
        self.committed
    }

    pub(crate) const fn initial_reserve(&self) -> u64 {
        self.initial_reserve
    }

    /// Reservation left before an allocation would overrun it
    #[inline]
    pub(crate) const fn headroom(&self) -> u64 {
        self.reserved - self.committed
    }

    /// Committed bytes after allocating `size`, `None` on overflow
    #[inline]
    pub(crate) const fn commit_target(&self, size: u64) -> Option<u64> {
        self.committed.checked_add(size)
    }

    /// Replace the reservation. Never shrinks below committed.
    pub(crate) fn grow_to(&mut self, reserved: u64) {
        debug_assert!(reserved >= self.committed);
        debug_assert!(reserved > self.reserved);
        self.reserved = reserved;
        self.growth_count += 1;
    }

    /// Bump the cursor by `size`. The caller has made room already.
    pub(crate) fn commit(&mut self, size: u64) -> Allocation {
        debug_assert!(self.committed + size <= self.reserved);
        let offset = self.committed;
        self.committed += size;
        if size > 0 {
            self.allocation_count += 1;
        }
        if self.committed > self.peak_committed {
            self.peak_committed = self.committed;
        }
        Allocation { offset, size }
    }

    /// Rewind to empty; returns the bytes released
    pub(crate) fn free_all(&mut self) -> u64 {
        std::mem::take(&mut self.committed)
    }

    /// Drop the whole reservation if nothing is committed; returns the bytes
    /// released
    pub(crate) fn release_reservation(&mut self) -> u64 {
        if self.committed == 0 {
            std::mem::take(&mut self.reserved)
        } else {
            0
        }
    }

    pub(crate) const fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved: self.reserved,
            committed: self.committed,
            peak_committed: self.peak_committed,
            growth_count: self.growth_count,
            allocation_count: self.allocation_count,
        }
    }
}

/// Reservation to grow to so that `needed` committed bytes fit.
///
/// A released arena (`current == 0`) restarts from its initial reservation;
/// otherwise the reservation is multiplied by `factor`. The result is never
/// below `needed` and always a multiple of `granularity`.
pub(crate) fn grown_reservation(
    current: u64,
    needed: u64,
    initial: u64,
    granularity: u64,
    factor: u64,
) -> Option<u64> {
    let base = if current == 0 {
        initial
    } else {
        current.saturating_mul(factor)
    };
    let needed = align_up(needed, granularity)?;
    let base = align_up(base, granularity).unwrap_or(u64::MAX & !(granularity - 1));
    Some(needed.max(base))
}
