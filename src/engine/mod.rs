//! The allocation engine (spec §4.4): builds a Request, picks a pool,
//! materializes a Grant, rebalances other Grants upward, and persists.

use crate::error::{Error, Result};
use crate::grant::{Allocations, Grant};
use crate::pool::PoolTree;
use crate::request::{ContainerSpec, Isolation, Request};
use crate::scoring::{self, Score};
use crate::types::{ContainerId, CpuKind, CpuSet, MemoryTier, PoolId};
use std::collections::BTreeMap;

pub struct Engine {
    pub tree: PoolTree,
    pub allocations: Allocations,
}

impl Engine {
    pub fn new(tree: PoolTree) -> Engine {
        Engine { tree, allocations: Allocations::new() }
    }

    /// Spec §4.4 steps 1-8.
    pub fn allocate(&mut self, c: &ContainerSpec, pool_hint: Option<PoolId>) -> Result<&Grant> {
        let request = Request::new_from_container(c)?;

        let chosen = if c.namespace == "system" && request.cpu_kind == CpuKind::Normal {
            // Step 2: system namespace, normal CPU kind -> root unconditionally.
            self.tree.root
        } else {
            let cands = scoring::candidates(&self.tree, &request);
            if cands.is_empty() {
                return Err(Error::insufficient(
                    "no pool has sufficient capacity for this request",
                    c.id.0.clone(),
                ));
            }
            let mut scored: Vec<Score> =
                cands.iter().map(|&id| Score::compute(&self.tree, self.tree.node(id), &request)).collect();
            scored.sort_by(|a, b| scoring::compare(&self.tree, &request, a, b));

            match pool_hint {
                Some(hint) if scored.iter().any(|s| s.pool == hint) => hint,
                _ => scored[0].pool,
            }
        };

        let grant = self.materialize_grant(&request, chosen)?;
        tracing::info!(container = %c.id, pool = %chosen, "allocated grant");
        self.allocations.insert(c.id.clone(), grant);

        self.rebalance_upward();

        Ok(self.allocations.get(&c.id).expect("just inserted"))
    }

    fn materialize_grant(&mut self, request: &Request, pool_id: PoolId) -> Result<Grant> {
        let supply = &mut self.tree.node_mut(pool_id).supply;

        let (exclusive, shared, shared_milli, reserved, reserved_milli) = match request.cpu_kind {
            CpuKind::Reserved => {
                if !supply.claim_reserved_milli(request.fraction) {
                    return Err(Error::insufficient("reserved capacity exhausted", request.container.0.clone()));
                }
                (CpuSet::new(), CpuSet::new(), 0, CpuSet::new(), request.fraction)
            }
            CpuKind::Normal => {
                let exclusive = if request.full > 0 {
                    let claimed = if request.isolation == Isolation::Isolated {
                        supply.claim_isolated(request.full as usize)
                    } else {
                        supply.claim_exclusive(request.full as usize)
                    };
                    claimed.ok_or_else(|| Error::insufficient("exclusive CPUs exhausted", request.container.0.clone()))?
                } else {
                    CpuSet::new()
                };
                if request.fraction > 0 && !supply.claim_shared_milli(request.fraction) {
                    supply.release_isolated(&exclusive);
                    supply.release_exclusive(&exclusive);
                    return Err(Error::insufficient("shared capacity exhausted", request.container.0.clone()));
                }
                (exclusive.clone(), exclusive, request.fraction, CpuSet::new(), 0)
            }
        };

        let mem_pool = pool_id;
        let mut mem_limits: BTreeMap<MemoryTier, u64> = BTreeMap::new();
        for tier in request.memory_type_mask.iter() {
            if self.tree.node(mem_pool).memset(&self.tree, request.memory_type_mask).iter().any(|id| {
                self.tree.topology().node(*id).map(|n| n.memory_type) == Some(tier)
            }) {
                mem_limits.insert(tier, request.memory_amount);
                break;
            }
        }
        let primary_tier = *mem_limits.keys().next().unwrap_or(&MemoryTier::Dram);
        self.tree.node_mut(mem_pool).supply.reserve_memory_local(primary_tier, request.memory_amount);
        for descendant in self.tree.descendants(mem_pool) {
            self.tree.node_mut(descendant).supply.add_extra_reservation(primary_tier, request.memory_amount);
        }

        Ok(Grant::new(
            &self.tree,
            request.container.clone(),
            pool_id,
            mem_pool,
            exclusive,
            shared,
            shared_milli,
            reserved,
            reserved_milli,
            request.memory_type_mask,
            mem_limits,
            request.cold_start,
        ))
    }

    /// Spec §4.4 step 6: "Iterate existing Grants: if any Grant G' has
    /// memset(G') subset of memset (proper subset) and cannot now satisfy
    /// its per-tier demand at its current pool given the new
    /// extra-reservations, call G'.expand_memset(). Re-check until no
    /// further moves occur."
    ///
    /// Terminates because each move strictly increases the memory memset
    /// and the tree has finite depth, bounding the loop by
    /// `tree_depth * |Allocations|`.
    fn rebalance_upward(&mut self) {
        let bound = (self.tree.depth + 1) * self.allocations.len().max(1);
        for _ in 0..bound {
            let mut moved = false;
            let ids: Vec<ContainerId> = self.allocations.keys().cloned().collect();
            for id in ids {
                let needs_expand = {
                    let grant = &self.allocations[&id];
                    grant
                        .mem_limits
                        .keys()
                        .any(|tier| self.tree.node(grant.mem_pool).supply.free_memory(*tier) < 0)
                };
                if needs_expand {
                    let grant = self.allocations.get_mut(&id).expect("present");
                    if grant.expand_memset(&self.tree) {
                        tracing::warn!(container = %id, "rebalanced memory pool upward");
                        moved = true;
                    }
                }
            }
            if !moved {
                break;
            }
        }
    }

    /// Spec §4.4: "release(container) removes the Grant, releases its CPU
    /// and memory reservations, and persists."
    pub fn release(&mut self, container: &ContainerId) -> Option<Grant> {
        let grant = self.allocations.remove(container)?;
        let supply = &mut self.tree.node_mut(grant.cpu_pool).supply;
        if !grant.exclusive.is_empty() {
            supply.release_isolated(&grant.exclusive);
            supply.release_exclusive(&grant.exclusive);
        }
        if grant.shared_milli > 0 {
            supply.release_shared_milli(grant.shared_milli);
        }
        if grant.reserved_milli > 0 {
            supply.release_reserved_milli(grant.reserved_milli);
        }
        for (&tier, &amount) in &grant.mem_limits {
            self.tree.node_mut(grant.mem_pool).supply.release_memory_local(tier, amount);
            for descendant in self.tree.descendants(grant.mem_pool) {
                self.tree.node_mut(descendant).supply.remove_extra_reservation(tier, amount);
            }
        }
        tracing::info!(container = %container, "released grant");
        Some(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;
    use crate::pool::Builder;
    use crate::topology::Discovery;
    use crate::types::QosClass;

    fn engine_two_numa() -> Engine {
        let fs = FakeFs::new();
        fs.set("/sys/devices/system/node/node0/cpulist", "0-3\n");
        fs.set("/sys/devices/system/node/node0/distance", "10 20\n");
        fs.set("/sys/devices/system/node/node0/meminfo", "Node 0 MemTotal: 8388608 kB\n");
        fs.set("/sys/devices/system/node/node1/cpulist", "4-7\n");
        fs.set("/sys/devices/system/node/node1/distance", "20 10\n");
        fs.set("/sys/devices/system/node/node1/meminfo", "Node 1 MemTotal: 8388608 kB\n");
        fs.set("/sys/devices/system/cpu/cpu0/topology/physical_package_id", "0");
        fs.set("/sys/devices/system/cpu/cpu0/topology/die_id", "0");
        fs.set("/sys/devices/system/cpu/cpu4/topology/physical_package_id", "0");
        fs.set("/sys/devices/system/cpu/cpu4/topology/die_id", "0");
        let topo = Discovery::new("/sys").discover(&fs).unwrap();
        Engine::new(Builder::build(topo).unwrap())
    }

    fn spec(id: &str, full_milli: u32) -> ContainerSpec {
        ContainerSpec {
            id: ContainerId::from(id),
            namespace: "default".into(),
            qos: QosClass::Guaranteed,
            cpu_milli: full_milli,
            memory_limit_bytes: Some(1 << 20),
            memory_request_bytes: 1 << 20,
            annotations: BTreeMap::new(),
            affinity: BTreeMap::new(),
            topology_hints: BTreeMap::new(),
        }
    }

    #[test]
    fn s1_single_container_isolated_two_cpus() {
        let mut e = engine_two_numa();
        let mut c = spec("c1", 2000);
        c.annotations.insert("prefer-isolated-cpus".into(), "true".into());
        let grant = e.allocate(&c, None).unwrap();
        assert_eq!(grant.exclusive.len(), 2);
    }

    #[test]
    fn release_frees_capacity_for_reallocation() {
        let mut e = engine_two_numa();
        let c = spec("c1", 4000);
        e.allocate(&c, None).unwrap();
        assert!(e.release(&ContainerId::from("c1")).is_some());
        let c2 = spec("c2", 4000);
        assert!(e.allocate(&c2, None).is_ok());
    }

    #[test]
    fn system_namespace_normal_cpu_routes_to_root() {
        let mut e = engine_two_numa();
        let mut c = spec("sys1", 0);
        c.namespace = "system".into();
        c.qos = QosClass::System;
        let grant = e.allocate(&c, None).unwrap();
        assert_eq!(grant.cpu_pool, e.tree.root);
    }

    proptest::proptest! {
        // Testable property 2: "for every sequence of allocate/release
        // operations, for every pool and tier, used capacity never exceeds
        // configured capacity."
        #[test]
        fn capacity_never_oversubscribed(
            ops in proptest::collection::vec((1u32..3000, 0usize..6, proptest::bool::ANY), 1..40)
        ) {
            let mut e = engine_two_numa();
            let mut live: Vec<ContainerId> = Vec::new();
            for (i, (milli, release_slot, is_release)) in ops.into_iter().enumerate() {
                if is_release && !live.is_empty() {
                    let idx = release_slot % live.len();
                    let id = live.remove(idx);
                    e.release(&id);
                } else {
                    let id = ContainerId(format!("c{i}"));
                    let c = spec(&id.0, milli);
                    if e.allocate(&c, None).is_ok() {
                        live.push(id);
                    }
                }
                for pool in e.tree.iter() {
                    proptest::prop_assert!(pool.supply.isolated_capacity() >= 0);
                    proptest::prop_assert!(pool.supply.exclusive_capacity() >= 0);
                    proptest::prop_assert!(pool.supply.shared_capacity_milli() >= 0);
                    proptest::prop_assert!(pool.supply.reserved_capacity_milli() >= 0);
                    for tier in [MemoryTier::Dram, MemoryTier::Pmem, MemoryTier::Hbm] {
                        proptest::prop_assert!(pool.supply.used_memory(tier) <= pool.supply.memory_limit(tier));
                    }
                }
            }
        }
    }
}
