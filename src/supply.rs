//! Per-pool capacity accounting (spec §3, §4.1).
//!
//! `Supply` owns one pool's CPU and per-tier memory bookkeeping. CPU
//! capacity is tracked as a single "normal" slice plus a disjoint
//! "reserved" slice (spec Glossary, "Reserved CPU"); isolated, exclusive
//! and shared are three different ways of drawing from the normal slice
//! rather than three separate physical sets, which is what lets a single
//! CPU move from "available for milli-slicing" to "claimed whole" as
//! grants come and go.

use crate::types::{CpuSet, MemoryTier};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Supply {
    /// Non-reserved CPUs owned by this pool.
    pub normal_cpus: CpuSet,
    /// Configured slice reserved for the system namespace (spec §4.1).
    pub reserved_cpus: CpuSet,
    /// Subset of `normal_cpus` eligible for isolated exclusive grants.
    /// Defaults to all of `normal_cpus`; a configuration may carve out a
    /// smaller dedicated slice.
    pub isolated_eligible: CpuSet,

    /// Whole CPUs out of `normal_cpus` claimed by any exclusive grant
    /// (isolated or not).
    used_whole: CpuSet,
    /// The subset of `used_whole` claimed specifically by isolated grants.
    used_isolated: CpuSet,
    /// Milli-CPU consumed by fractional grants drawn from the CPUs in
    /// `normal_cpus` that are not in `used_whole`.
    used_shared_milli: u32,
    /// Milli-CPU consumed from `reserved_cpus`.
    used_reserved_milli: u32,

    pub memory_capacity: BTreeMap<MemoryTier, u64>,
    used_memory: BTreeMap<MemoryTier, u64>,
    extra_reservation: BTreeMap<MemoryTier, u64>,
}

impl Supply {
    pub fn new(normal_cpus: CpuSet, reserved_cpus: CpuSet, memory_capacity: BTreeMap<MemoryTier, u64>) -> Self {
        Self {
            isolated_eligible: normal_cpus.clone(),
            normal_cpus,
            reserved_cpus,
            used_whole: CpuSet::new(),
            used_isolated: CpuSet::new(),
            used_shared_milli: 0,
            used_reserved_milli: 0,
            memory_capacity,
            used_memory: BTreeMap::new(),
            extra_reservation: BTreeMap::new(),
        }
    }

    // --- capacity (spec §4.3 Score fields) ---------------------------------

    pub fn isolated_capacity(&self) -> i64 {
        self.isolated_eligible.difference(&self.used_whole).len() as i64
    }

    pub fn exclusive_capacity(&self) -> i64 {
        self.normal_cpus.difference(&self.used_whole).len() as i64
    }

    pub fn shared_capacity_milli(&self) -> i64 {
        let free_whole = self.normal_cpus.difference(&self.used_whole).len() as i64;
        free_whole * 1000 - self.used_shared_milli as i64
    }

    pub fn reserved_capacity_milli(&self) -> i64 {
        self.reserved_cpus.len() as i64 * 1000 - self.used_reserved_milli as i64
    }

    pub fn sharable_cpus(&self) -> CpuSet {
        self.normal_cpus.difference(&self.used_whole)
    }

    pub fn isolated_cpus(&self) -> CpuSet {
        self.isolated_eligible.difference(&self.used_whole)
    }

    pub fn reserved_cpus(&self) -> CpuSet {
        self.reserved_cpus.clone()
    }

    pub fn memory_limit(&self, tier: MemoryTier) -> u64 {
        self.memory_capacity.get(&tier).copied().unwrap_or(0)
    }

    pub fn used_memory(&self, tier: MemoryTier) -> u64 {
        self.used_memory.get(&tier).copied().unwrap_or(0)
    }

    pub fn extra_memory_reservation(&self, tier: MemoryTier) -> u64 {
        self.extra_reservation.get(&tier).copied().unwrap_or(0)
    }

    pub fn free_memory(&self, tier: MemoryTier) -> i64 {
        self.memory_limit(tier) as i64 - self.used_memory(tier) as i64 - self.extra_memory_reservation(tier) as i64
    }

    // --- CPU mutation (spec §4.1 invariant: sum of exclusive + shared
    // milli portions never exceeds supply) ----------------------------------

    /// Claim `count` whole CPUs out of the isolated-eligible slice,
    /// returning the CPUs picked (lowest ids first, for determinism).
    pub fn claim_isolated(&mut self, count: usize) -> Option<CpuSet> {
        let free = self.isolated_cpus();
        if free.len() < count {
            return None;
        }
        let picked: CpuSet = CpuSet::from_iter(free.0.into_iter().take(count));
        self.used_whole = self.used_whole.union(&picked);
        self.used_isolated = self.used_isolated.union(&picked);
        Some(picked)
    }

    /// Claim `count` whole CPUs for an exclusive, non-isolated grant.
    pub fn claim_exclusive(&mut self, count: usize) -> Option<CpuSet> {
        let free = self.sharable_cpus();
        if free.len() < count {
            return None;
        }
        let picked: CpuSet = CpuSet::from_iter(free.0.into_iter().take(count));
        self.used_whole = self.used_whole.union(&picked);
        Some(picked)
    }

    pub fn claim_shared_milli(&mut self, milli: u32) -> bool {
        if self.shared_capacity_milli() < milli as i64 {
            return false;
        }
        self.used_shared_milli += milli;
        true
    }

    pub fn claim_reserved_milli(&mut self, milli: u32) -> bool {
        if self.reserved_capacity_milli() < milli as i64 {
            return false;
        }
        self.used_reserved_milli += milli;
        true
    }

    /// Re-reserve CPUs already chosen by a prior allocation, used when
    /// replaying persisted state on startup (spec §6 "replays `allocations`
    /// by re-reserving each Grant's supply from its named pool") rather than
    /// picking fresh CPUs as `claim_isolated`/`claim_exclusive` would.
    pub fn reserve_exact_whole(&mut self, cpus: &CpuSet, isolated: bool) {
        self.used_whole = self.used_whole.union(cpus);
        if isolated {
            self.used_isolated = self.used_isolated.union(cpus);
        }
    }

    pub fn reserve_exact_shared_milli(&mut self, milli: u32) {
        self.used_shared_milli += milli;
    }

    pub fn reserve_exact_reserved_milli(&mut self, milli: u32) {
        self.used_reserved_milli += milli;
    }

    pub fn release_isolated(&mut self, cpus: &CpuSet) {
        self.used_whole = self.used_whole.difference(cpus);
        self.used_isolated = self.used_isolated.difference(cpus);
    }

    pub fn release_exclusive(&mut self, cpus: &CpuSet) {
        self.used_whole = self.used_whole.difference(cpus);
    }

    pub fn release_shared_milli(&mut self, milli: u32) {
        self.used_shared_milli = self.used_shared_milli.saturating_sub(milli);
    }

    pub fn release_reserved_milli(&mut self, milli: u32) {
        self.used_reserved_milli = self.used_reserved_milli.saturating_sub(milli);
    }

    // --- memory mutation -----------------------------------------------------

    pub fn reserve_memory_local(&mut self, tier: MemoryTier, bytes: u64) {
        *self.used_memory.entry(tier).or_insert(0) += bytes;
    }

    pub fn release_memory_local(&mut self, tier: MemoryTier, bytes: u64) {
        if let Some(used) = self.used_memory.get_mut(&tier) {
            *used = used.saturating_sub(bytes);
        }
    }

    pub fn add_extra_reservation(&mut self, tier: MemoryTier, bytes: u64) {
        *self.extra_reservation.entry(tier).or_insert(0) += bytes;
    }

    pub fn remove_extra_reservation(&mut self, tier: MemoryTier, bytes: u64) {
        if let Some(extra) = self.extra_reservation.get_mut(&tier) {
            *extra = extra.saturating_sub(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(cpus: &[u32], reserved: &[u32]) -> Supply {
        let mut cap = BTreeMap::new();
        cap.insert(MemoryTier::Dram, 4 * 1024 * 1024 * 1024);
        Supply::new(CpuSet::from_iter(cpus.iter().copied()), CpuSet::from_iter(reserved.iter().copied()), cap)
    }

    #[test]
    fn whole_cpu_claims_reduce_milli_capacity_too() {
        let mut s = supply(&[0, 1, 2, 3], &[]);
        assert_eq!(s.shared_capacity_milli(), 4000);
        let picked = s.claim_isolated(2).unwrap();
        assert_eq!(picked.len(), 2);
        assert_eq!(s.shared_capacity_milli(), 2000);
        assert_eq!(s.isolated_capacity(), 2);
    }

    #[test]
    fn memory_accounting_respects_extra_reservation() {
        let mut s = supply(&[0], &[]);
        assert_eq!(s.free_memory(MemoryTier::Dram), 4 * 1024 * 1024 * 1024);
        s.reserve_memory_local(MemoryTier::Dram, 1024 * 1024 * 1024);
        s.add_extra_reservation(MemoryTier::Dram, 1024 * 1024 * 1024);
        assert_eq!(s.free_memory(MemoryTier::Dram), 2 * 1024 * 1024 * 1024);
    }
}
