//! Candidate filtering and the strict pool-ordering comparator (spec §4.3).

use crate::pool::{PoolNode, PoolTree};
use crate::request::{Isolation, Request};
use crate::types::{CpuKind, PoolId};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct Score {
    pub pool: PoolId,
    pub isolated_capacity: i64,
    pub reserved_capacity: i64,
    pub shared_capacity: i64,
    pub affinity: f64,
    pub mask_matches: bool,
    pub topology_hint_score: f64,
    pub topology_hint_nonzero_product: f64,
    pub depth: usize,
    pub colocated: u32,
}

impl Score {
    /// Spec §4.3: "produce a Score with fields ... each = free - what R
    /// would consume, negative means insufficient."
    pub fn compute(tree: &PoolTree, pool: &PoolNode, request: &Request) -> Score {
        let supply = &pool.supply;
        let isolated_capacity = supply.isolated_capacity() - request_isolated_demand(request);
        let reserved_capacity = supply.reserved_capacity_milli() - request_reserved_demand(request);
        let shared_capacity = supply.shared_capacity_milli() - request_shared_demand(request);

        let affinity = affinity_score(tree, pool.id, request);
        let mask_matches = tree
            .node(pool.id)
            .memset(tree, request.memory_type_mask)
            .iter()
            .next()
            .is_some();

        // Topology hints are per-request numeric scores already keyed by
        // name; the "combined" score is their sum, and the tie-break
        // product ignores any hint that evaluated to zero (spec §4.3 rule
        // 4's "zero-filtered hint product").
        let mut hint_sum = 0.0;
        let mut hint_product = 1.0;
        for v in request.topology_hints.values() {
            hint_sum += v;
            if *v != 0.0 {
                hint_product *= v;
            }
        }

        Score {
            pool: pool.id,
            isolated_capacity,
            reserved_capacity,
            shared_capacity,
            affinity,
            mask_matches,
            topology_hint_score: hint_sum,
            topology_hint_nonzero_product: hint_product,
            depth: pool.depth,
            colocated: pool.colocated,
        }
    }
}

fn request_isolated_demand(r: &Request) -> i64 {
    if r.cpu_kind == CpuKind::Normal && r.isolation == Isolation::Isolated { r.full as i64 } else { 0 }
}

fn request_reserved_demand(r: &Request) -> i64 {
    if r.cpu_kind == CpuKind::Reserved { r.fraction as i64 } else { 0 }
}

fn request_shared_demand(r: &Request) -> i64 {
    if r.cpu_kind == CpuKind::Normal {
        let exclusive_whole = if r.isolation == Isolation::Isolated { 0 } else { r.full as i64 };
        exclusive_whole * 1000 + r.fraction as i64
    } else {
        0
    }
}

/// Spec §4.3 rule 2: "sum over ancestors of n of A(x)*0.75^depth(x->n) plus
/// the same over descendants."
fn affinity_score(tree: &PoolTree, pool: PoolId, request: &Request) -> f64 {
    if request.affinity.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for ancestor in tree.ancestors(pool) {
        let depth_diff = tree.node(pool).depth - tree.node(ancestor).depth;
        total += tree.node(ancestor).affinity * 0.75f64.powi(depth_diff as i32);
    }
    for descendant in tree.descendants(pool) {
        let depth_diff = tree.node(descendant).depth - tree.node(pool).depth;
        total += tree.node(descendant).affinity * 0.75f64.powi(depth_diff as i32);
    }
    total
}

/// Spec §4.3: the candidate set is all pools whose free memory (minus
/// extra-reservation) can hold the request under its memory-type mask; a
/// cold-start request additionally requires PMEM alone to suffice.
pub fn candidates(tree: &PoolTree, request: &Request) -> Vec<PoolId> {
    tree.iter()
        .filter(|pool| pool_can_hold(tree, pool, request))
        .map(|pool| pool.id)
        .collect()
}

fn pool_can_hold(tree: &PoolTree, pool: &PoolNode, request: &Request) -> bool {
    let memset = tree.node(pool.id).memset(tree, request.memory_type_mask);
    if memset.is_empty() {
        return false;
    }
    if request.cold_start.is_some() {
        // Spec §4.3: "if cold-start > 0, PMEM alone must suffice" — the
        // request will run on PMEM until the timer fires, so PMEM capacity
        // alone (not DRAM borrowed in the combined check below) decides.
        return pool.supply.free_memory(crate::types::MemoryTier::Pmem) >= request.memory_amount as i64;
    }
    for tier in request.memory_type_mask.iter() {
        if memset.iter().any(|id| tree.topology().node(*id).map(|n| n.memory_type) == Some(tier)) {
            let free = pool.supply.free_memory(tier);
            if free >= request.memory_amount as i64 {
                return true;
            }
        }
    }
    false
}

/// Spec §4.3: the strict 10-rule ordering comparator. Returns `Less` if `a`
/// should be preferred over `b`.
pub fn compare(tree: &PoolTree, request: &Request, a: &Score, b: &Score) -> Ordering {
    // Rule 1: insufficient capacity loses. The kind examined depends on the
    // request's CPU kind and isolation flag.
    let cap = |s: &Score| -> i64 {
        match (request.cpu_kind, request.isolation) {
            (CpuKind::Reserved, _) => s.reserved_capacity,
            (CpuKind::Normal, Isolation::Isolated) => s.isolated_capacity,
            (CpuKind::Normal, Isolation::Shared) => s.shared_capacity,
        }
    };
    let (ca, cb) = (cap(a), cap(b));
    if (ca < 0) != (cb < 0) {
        return if ca < 0 { Ordering::Greater } else { Ordering::Less };
    }

    // Rule 2: higher affinity score wins.
    if a.affinity != b.affinity {
        return b.affinity.partial_cmp(&a.affinity).unwrap_or(Ordering::Equal);
    }

    // Rule 3: a pool matching the memory-type mask beats one that does not.
    if a.mask_matches != b.mask_matches {
        return if a.mask_matches { Ordering::Less } else { Ordering::Greater };
    }

    // Rule 4: higher combined topology-hint score wins; tie -> zero-filtered
    // hint product; further tie -> deeper pool; final tie -> smaller ID.
    if a.topology_hint_score != b.topology_hint_score {
        return b.topology_hint_score.partial_cmp(&a.topology_hint_score).unwrap_or(Ordering::Equal);
    }
    if a.topology_hint_nonzero_product != b.topology_hint_nonzero_product {
        return b
            .topology_hint_nonzero_product
            .partial_cmp(&a.topology_hint_nonzero_product)
            .unwrap_or(Ordering::Equal);
    }
    if a.depth != b.depth {
        return b.depth.cmp(&a.depth);
    }
    let id_order = a.pool.0.cmp(&b.pool.0);
    if id_order != Ordering::Equal {
        return id_order;
    }

    // Rule 5: deeper pool wins (redundant once rule 4 already compared depth
    // on a genuine tie, kept for requests with no topology hints at all).
    if a.depth != b.depth {
        return b.depth.cmp(&a.depth);
    }

    match request.cpu_kind {
        CpuKind::Reserved => {
            // Rule 6: for reserved requests, more free reserved capacity per
            // colocated container wins.
            let per_a = a.reserved_capacity as f64 / (a.colocated as f64 + 1.0);
            let per_b = b.reserved_capacity as f64 / (b.colocated as f64 + 1.0);
            if per_a != per_b {
                return per_b.partial_cmp(&per_a).unwrap_or(Ordering::Equal);
            }
        }
        CpuKind::Normal => match request.isolation {
            Isolation::Isolated => {
                // Rule 7: isolated normal requests: more isolated capacity
                // wins; tie -> smaller ID.
                if a.isolated_capacity != b.isolated_capacity {
                    return b.isolated_capacity.cmp(&a.isolated_capacity);
                }
            }
            Isolation::Shared => {
                if request.full > 0 {
                    // Rule 8: exclusive (non-isolated) normal requests: more
                    // slicable shared capacity wins; tie -> smaller ID.
                    if a.shared_capacity != b.shared_capacity {
                        return b.shared_capacity.cmp(&a.shared_capacity);
                    }
                } else {
                    // Rule 9: shared-only normal requests: fewer colocated
                    // containers win; tie -> more shared capacity.
                    if a.colocated != b.colocated {
                        return a.colocated.cmp(&b.colocated);
                    }
                    if a.shared_capacity != b.shared_capacity {
                        return b.shared_capacity.cmp(&a.shared_capacity);
                    }
                }
            }
        },
    }

    // Rule 10: smaller ID wins.
    let _ = tree;
    a.pool.0.cmp(&b.pool.0)
}
