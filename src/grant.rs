//! The result of an allocation: an immutable (mostly) record of what a
//! container was granted (spec §3 "Grant", §4.1 `Grant.new`).

use crate::pool::PoolTree;
use crate::types::{ContainerId, CpuSet, MemTypeMask, Memset, MemoryTier, PoolId};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Grant {
    pub container: ContainerId,
    pub cpu_pool: PoolId,
    pub mem_pool: PoolId,
    pub exclusive: CpuSet,
    pub shared: CpuSet,
    pub shared_milli: u32,
    pub reserved: CpuSet,
    pub reserved_milli: u32,
    pub memset: Memset,
    pub mem_type_mask: MemTypeMask,
    pub mem_limits: BTreeMap<MemoryTier, u64>,
    /// Remaining cold-start duration; `None` once expired or never set.
    /// While `Some`, the DRAM bit is stripped from `memset` (spec §4.1).
    pub cold_start_remaining: Option<Duration>,
}

impl Grant {
    /// Spec §4.1: "the memset is `mem_pool.memset(mem_mask)`. During
    /// cold-start, the DRAM bit is stripped from the memset until the
    /// cold-start timer fires."
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: &PoolTree,
        container: ContainerId,
        cpu_pool: PoolId,
        mem_pool: PoolId,
        exclusive: CpuSet,
        shared: CpuSet,
        shared_milli: u32,
        reserved: CpuSet,
        reserved_milli: u32,
        mem_type_mask: MemTypeMask,
        mem_limits: BTreeMap<MemoryTier, u64>,
        cold_start: Option<Duration>,
    ) -> Grant {
        let mut memset = tree.node(mem_pool).memset(tree, mem_type_mask);
        if cold_start.is_some() {
            strip_tier(tree, &mut memset, MemoryTier::Dram);
        }
        Grant {
            container,
            cpu_pool,
            mem_pool,
            exclusive,
            shared,
            shared_milli,
            reserved,
            reserved_milli,
            memset,
            mem_type_mask,
            mem_limits,
            cold_start_remaining: cold_start,
        }
    }

    /// Spec §4.4 rebalance step: "move its memory pool to the parent."
    /// Promotes the memory pool one level up and recomputes the memset,
    /// re-applying the cold-start DRAM strip if still active.
    pub fn expand_memset(&mut self, tree: &PoolTree) -> bool {
        let Some(parent) = tree.node(self.mem_pool).parent else {
            return false;
        };
        self.mem_pool = parent;
        self.memset = tree.node(parent).memset(tree, self.mem_type_mask);
        if self.cold_start_remaining.is_some() {
            strip_tier(tree, &mut self.memset, MemoryTier::Dram);
        }
        true
    }

    /// Spec §4.11: "the engine atomically replaces the Grant's memset with
    /// the full set (DRAM + target tiers)" when the cold-start timer fires.
    pub fn finish_cold_start(&mut self, tree: &PoolTree) {
        self.cold_start_remaining = None;
        self.memset = tree.node(self.mem_pool).memset(tree, self.mem_type_mask);
    }

    pub fn full_count(&self) -> usize {
        self.exclusive.len()
    }
}

fn strip_tier(tree: &PoolTree, memset: &mut Memset, tier: MemoryTier) {
    memset.retain(|id| tree.topology().node(*id).is_some_and(|n| n.memory_type != tier));
}

/// Spec §3 "Allocations": "a map from container cache-ID to Grant."
pub type Allocations = BTreeMap<ContainerId, Grant>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;
    use crate::pool::Builder;
    use crate::topology::Discovery;

    fn tree_two_numa() -> PoolTree {
        let fs = FakeFs::new();
        fs.set("/sys/devices/system/node/node0/cpulist", "0-3\n");
        fs.set("/sys/devices/system/node/node0/distance", "10 20\n");
        fs.set("/sys/devices/system/node/node1/cpulist", "4-7\n");
        fs.set("/sys/devices/system/node/node1/distance", "20 10\n");
        fs.set("/sys/devices/system/cpu/cpu0/topology/physical_package_id", "0");
        fs.set("/sys/devices/system/cpu/cpu0/topology/die_id", "0");
        fs.set("/sys/devices/system/cpu/cpu4/topology/physical_package_id", "0");
        fs.set("/sys/devices/system/cpu/cpu4/topology/die_id", "0");
        let topo = Discovery::new("/sys").discover(&fs).unwrap();
        Builder::build(topo).unwrap()
    }

    #[test]
    fn cold_start_strips_dram_until_finished() {
        let tree = tree_two_numa();
        let leaf = tree.node(tree.root).children[0];
        let mut grant = Grant::new(
            &tree,
            ContainerId::from("c1"),
            leaf,
            leaf,
            CpuSet::new(),
            CpuSet::new(),
            0,
            CpuSet::new(),
            0,
            MemTypeMask::ALL,
            BTreeMap::new(),
            Some(Duration::from_secs(60)),
        );
        assert!(grant.memset.is_empty() || !grant.memset.iter().any(|id| tree.topology().node(*id).unwrap().memory_type == MemoryTier::Dram));
        grant.finish_cold_start(&tree);
        assert!(grant.cold_start_remaining.is_none());
    }

    #[test]
    fn expand_memset_promotes_to_parent() {
        let tree = tree_two_numa();
        let leaf = tree.node(tree.root).children[0];
        let mut grant = Grant::new(
            &tree,
            ContainerId::from("c1"),
            leaf,
            leaf,
            CpuSet::new(),
            CpuSet::new(),
            0,
            CpuSet::new(),
            0,
            MemTypeMask::ALL,
            BTreeMap::new(),
            None,
        );
        let before = grant.memset.len();
        assert!(grant.expand_memset(&tree));
        assert_eq!(grant.mem_pool, tree.root);
        assert!(grant.memset.len() >= before);
    }
}
