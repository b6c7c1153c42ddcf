//! The pool tree (spec §3, §4.2): a hierarchy of virtual-root/socket/die/NUMA
//! pools over the discovered [`crate::topology::Topology`], each carrying a
//! [`Supply`] and a pair of memsets.
//!
//! Pools live in a single arena (`Vec<PoolNode>`) and are referenced by
//! [`PoolId`] index rather than by parent/child pointers, per DESIGN NOTES
//! §9 — this sidesteps the aliasing that an `Rc<RefCell<_>>` tree would
//! otherwise force onto every read.

use crate::error::{Error, Result};
use crate::supply::Supply;
use crate::topology::{SystemNode, Topology};
use crate::types::{MemTypeMask, Memset, MemoryTier, PoolId, SystemNodeId};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    VirtualRoot,
    Socket,
    Die,
    Numa,
}

#[derive(Debug)]
pub struct PoolNode {
    pub id: PoolId,
    pub name: String,
    pub kind: PoolKind,
    pub depth: usize,
    pub parent: Option<PoolId>,
    pub children: Vec<PoolId>,

    pub supply: Supply,

    /// SystemNode ids this pool owns directly (its own NUMA leaves, plus any
    /// PMEM-only nodes folded into it as a surrogate).
    pub system_nodes: BTreeSet<SystemNodeId>,

    /// Container-affinity weight accumulated at this pool (spec §4.3 rule 2),
    /// updated by the engine as Grants land and leave.
    pub affinity: f64,

    /// Count of containers whose Grant's CPU pool is exactly this pool
    /// (spec §4.3 rule 2 "colocated").
    pub colocated: u32,
}

impl PoolNode {
    /// The CPU memset: SystemNode ids reachable by descending from this pool
    /// (spec §3 "a CPU memset ... yields pinning candidates").
    pub fn cpu_memset(&self, tree: &PoolTree) -> BTreeSet<SystemNodeId> {
        let mut out = BTreeSet::new();
        tree.collect_system_nodes(self.id, &mut out);
        out
    }

    /// The memory memset filtered to the tiers in `mask` (spec §4.1
    /// `Grant.new`: "the memset is `mem_pool.memset(mem_mask)`").
    pub fn memset(&self, tree: &PoolTree, mask: MemTypeMask) -> Memset {
        let mut nodes = BTreeSet::new();
        tree.collect_system_nodes(self.id, &mut nodes);
        nodes
            .into_iter()
            .filter(|id| tree.topology.node(*id).is_some_and(|n| mask.contains(n.memory_type)))
            .collect()
    }

    /// The actual CPU ids reachable by descending from this pool, used to
    /// resolve a config-level "pools named in a CPU class table" (spec
    /// §4.6) entry into a concrete `CpuSet`.
    pub fn cpus(&self, tree: &PoolTree) -> crate::types::CpuSet {
        let mut out = crate::types::CpuSet::new();
        for id in self.cpu_memset(tree) {
            if let Some(node) = tree.topology.node(id) {
                out = out.union(&node.cpus);
            }
        }
        out
    }
}

pub struct PoolTree {
    pub nodes: Vec<PoolNode>,
    pub root: PoolId,
    pub depth: usize,
    topology: Topology,
}

impl PoolTree {
    pub fn node(&self, id: PoolId) -> &PoolNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: PoolId) -> &mut PoolNode {
        &mut self.nodes[id.0]
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Looks up a pool by its assigned name (spec §4.6 "pools named in a
    /// CPU class table"), e.g. `"socket0"` or `"numa1"`.
    pub fn pool_by_name(&self, name: &str) -> Option<&PoolNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn collect_system_nodes(&self, id: PoolId, out: &mut BTreeSet<SystemNodeId>) {
        let node = self.node(id);
        out.extend(node.system_nodes.iter().copied());
        for &child in &node.children {
            self.collect_system_nodes(child, out);
        }
    }

    pub fn ancestors(&self, id: PoolId) -> Vec<PoolId> {
        let mut out = Vec::new();
        let mut cur = self.node(id).parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.node(p).parent;
        }
        out
    }

    pub fn is_proper_ancestor(&self, ancestor: PoolId, of: PoolId) -> bool {
        self.ancestors(of).contains(&ancestor)
    }

    pub fn descendants(&self, id: PoolId) -> Vec<PoolId> {
        let mut out = Vec::new();
        for &child in &self.node(id).children {
            out.push(child);
            out.extend(self.descendants(child));
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolNode> {
        self.nodes.iter()
    }
}

/// Working tree shape before Supply/memset materialization, built from
/// topology grouping alone (spec §3 construction rules).
struct Shape {
    kind: PoolKind,
    name: String,
    children: Vec<Shape>,
    system_nodes: BTreeSet<SystemNodeId>,
}

/// Builds a [`PoolTree`] from a discovered [`Topology`] (spec §4.2).
pub struct Builder;

impl Builder {
    /// Builds a tree with no reserved-CPU configuration (every CPU is
    /// available to normal grants). Most call sites outside `main.rs` want
    /// this; production wiring goes through [`Builder::build_with_reserved`].
    pub fn build(topology: Topology) -> Result<PoolTree> {
        Self::build_with_reserved(topology, &crate::types::CpuSet::new())
    }

    /// Spec §3: "a Supply ... exclusive/isolated/shared/reserved CPUs (the
    /// reserved subset is a configured slice of the node's CPUs)." `reserved`
    /// is the operator-configured global reserved-CPU slice (spec §4.1,
    /// "Reserved CPU"); each pool's reserved/normal split is that pool's
    /// owned CPUs intersected with / minus `reserved`.
    pub fn build_with_reserved(topology: Topology, reserved: &crate::types::CpuSet) -> Result<PoolTree> {
        let dram_or_cpu: Vec<&SystemNode> =
            topology.nodes.iter().filter(|n| n.memory_type != MemoryTier::Pmem || n.has_cpus()).collect();
        let pmem_only: Vec<&SystemNode> =
            topology.nodes.iter().filter(|n| n.memory_type == MemoryTier::Pmem && !n.has_cpus()).collect();

        let sockets = topology.sockets();
        if sockets.is_empty() {
            return Err(Error::topology("topology has no sockets"));
        }

        let mut socket_shapes = Vec::new();
        for &package_id in &sockets {
            let dies = topology.dies_in_socket(package_id);
            let has_die_level = dies.len() >= 2;

            let mut socket_children = Vec::new();
            for &die_id in &dies {
                let mut numa_nodes: Vec<&SystemNode> = dram_or_cpu
                    .iter()
                    .copied()
                    .filter(|n| n.package_id == package_id && n.die_id == die_id)
                    .collect();
                numa_nodes.sort_by_key(|n| n.id);

                let numa_shapes: Vec<Shape> = numa_nodes
                    .iter()
                    .map(|n| Shape {
                        kind: PoolKind::Numa,
                        name: format!("numa{}", n.id),
                        children: Vec::new(),
                        system_nodes: BTreeSet::from([n.id]),
                    })
                    .collect();

                if has_die_level {
                    socket_children.push(fold_if_single(numa_shapes, PoolKind::Die, format!("die{package_id}.{die_id}")));
                } else {
                    // No separate die level (spec §3: "a die level exists
                    // inside a socket only if the socket has >= 2 dies"):
                    // the numa nodes of this lone die attach straight to
                    // the socket.
                    socket_children.extend(numa_shapes);
                }
            }

            socket_shapes.push(fold_if_single(socket_children, PoolKind::Socket, format!("socket{package_id}")));
        }

        let mut root = if sockets.len() >= 2 {
            Shape { kind: PoolKind::VirtualRoot, name: "root".to_string(), children: socket_shapes, system_nodes: BTreeSet::new() }
        } else {
            socket_shapes.into_iter().next().expect("at least one socket")
        };

        assign_pmem_surrogates(&mut root, &topology, &pmem_only)?;

        let mut tree = PoolTree { nodes: Vec::new(), root: PoolId(0), depth: 0, topology };
        let root_id = flatten(&mut tree.nodes, &root, None, 0, &mut tree.depth);
        tree.root = root_id;

        materialize_supply(&mut tree, reserved);
        Ok(tree)
    }
}

/// Spec §3: "A NUMA leaf is omitted if it would be the only child of its
/// parent; its resources are then folded into that parent (surrogate),
/// which becomes the leaf for that branch." The parent survives as a leaf
/// under its own kind/name, absorbing the omitted child's SystemNodes —
/// the child, not the parent, is what disappears from the tree.
fn fold_if_single(children: Vec<Shape>, kind: PoolKind, name: String) -> Shape {
    if children.len() == 1 {
        let only = children.into_iter().next().unwrap();
        debug_assert!(only.children.is_empty(), "fold_if_single only ever folds a leaf child");
        Shape { kind, name, children: Vec::new(), system_nodes: only.system_nodes }
    } else {
        let mut system_nodes = BTreeSet::new();
        for c in &children {
            system_nodes.extend(c.system_nodes.iter().copied());
        }
        Shape { kind, name, children, system_nodes }
    }
}

/// Spec §3: each PMEM-only NUMA node's memory is assigned to exactly one of
/// the closest DRAM NUMA nodes (or their surrogate), ties broken by lowest
/// NUMA ID and by least-loaded surrogate among equally-close candidates.
fn assign_pmem_surrogates(root: &mut Shape, topology: &Topology, pmem_only: &[&SystemNode]) -> Result<()> {
    for pmem in pmem_only {
        let mut leaves = Vec::new();
        collect_leaf_system_nodes(root, &mut leaves);

        let mut best: Option<(u32, SystemNodeId)> = None;
        for &leaf_node_id in &leaves {
            let dist = topology.node(leaf_node_id).map(|n| n.distance_to(pmem.id)).unwrap_or(u32::MAX);
            match best {
                None => best = Some((dist, leaf_node_id)),
                Some((best_dist, best_id)) => {
                    if dist < best_dist || (dist == best_dist && leaf_node_id < best_id) {
                        best = Some((dist, leaf_node_id));
                    }
                }
            }
        }
        let Some((_, target)) = best else {
            return Err(Error::topology(format!(
                "no DRAM surrogate available for PMEM-only node {}",
                pmem.id
            )));
        };
        attach_pmem(root, target, pmem.id);
    }
    Ok(())
}

fn collect_leaf_system_nodes(shape: &Shape, out: &mut Vec<SystemNodeId>) {
    if shape.children.is_empty() {
        out.extend(shape.system_nodes.iter().copied());
    } else {
        for c in &shape.children {
            collect_leaf_system_nodes(c, out);
        }
    }
}

fn attach_pmem(shape: &mut Shape, target: SystemNodeId, pmem: SystemNodeId) -> bool {
    if shape.children.is_empty() {
        if shape.system_nodes.contains(&target) {
            shape.system_nodes.insert(pmem);
            return true;
        }
        return false;
    }
    for c in &mut shape.children {
        if attach_pmem(c, target, pmem) {
            shape.system_nodes.insert(pmem);
            return true;
        }
    }
    false
}

fn flatten(nodes: &mut Vec<PoolNode>, shape: &Shape, parent: Option<PoolId>, depth: usize, max_depth: &mut usize) -> PoolId {
    *max_depth = (*max_depth).max(depth);
    let id = PoolId(nodes.len());
    nodes.push(PoolNode {
        id,
        name: shape.name.clone(),
        kind: shape.kind,
        depth,
        parent,
        children: Vec::new(),
        supply: Supply::new(Default::default(), Default::default(), BTreeMap::new()),
        system_nodes: shape.system_nodes.clone(),
        affinity: 0.0,
        colocated: 0,
    });
    let mut children = Vec::new();
    for c in &shape.children {
        children.push(flatten(nodes, c, Some(id), depth + 1, max_depth));
    }
    nodes[id.0].children = children;
    id
}

/// Computes each pool's Supply by summing the CPUs/memory of the SystemNodes
/// it transitively owns (spec §4.2), splitting each pool's CPUs into the
/// configured reserved slice and the rest.
fn materialize_supply(tree: &mut PoolTree, reserved: &crate::types::CpuSet) {
    let all_ids: Vec<PoolId> = tree.nodes.iter().map(|n| n.id).collect();
    for id in all_ids {
        let mut owned = BTreeSet::new();
        tree.collect_system_nodes(id, &mut owned);

        let mut cpus = crate::types::CpuSet::new();
        let mut memory_capacity: BTreeMap<MemoryTier, u64> = BTreeMap::new();
        for node_id in &owned {
            if let Some(node) = tree.topology.node(*node_id) {
                cpus = cpus.union(&node.cpus);
                *memory_capacity.entry(node.memory_type).or_insert(0) += node.memory_bytes;
            }
        }
        let pool_reserved = cpus.intersection(reserved);
        let normal = cpus.difference(&pool_reserved);
        tree.node_mut(id).supply = Supply::new(normal, pool_reserved, memory_capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;
    use crate::topology::Discovery;

    fn fs_two_socket_one_pmem() -> FakeFs {
        let fs = FakeFs::new();
        fs.set("/sys/devices/system/node/node0/cpulist", "0-3\n");
        fs.set("/sys/devices/system/node/node0/distance", "10 20 30\n");
        fs.set("/sys/devices/system/node/node1/cpulist", "4-7\n");
        fs.set("/sys/devices/system/node/node1/distance", "20 10 30\n");
        fs.set("/sys/devices/system/node/node2/cpulist", "");
        fs.set("/sys/devices/system/node/node2/distance", "30 30 10\n");
        fs.set("/sys/devices/system/cpu/cpu0/topology/physical_package_id", "0");
        fs.set("/sys/devices/system/cpu/cpu0/topology/die_id", "0");
        fs.set("/sys/devices/system/cpu/cpu4/topology/physical_package_id", "1");
        fs.set("/sys/devices/system/cpu/cpu4/topology/die_id", "0");
        fs
    }

    #[test]
    fn single_socket_two_numa_both_with_cpus_yields_socket_root_with_two_leaves() {
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
        let tree = Builder::build(topo).unwrap();
        let root = tree.node(tree.root);
        assert_eq!(root.kind, PoolKind::Socket);
        assert_eq!(root.children.len(), 2);
        for &child in &root.children {
            assert_eq!(tree.node(child).kind, PoolKind::Numa);
        }
    }

    #[test]
    fn two_sockets_with_pmem_node_assigns_surrogate_and_virtual_root() {
        let fs = fs_two_socket_one_pmem();
        let topo = Discovery::new("/sys").discover(&fs).unwrap();
        let tree = Builder::build(topo).unwrap();
        let root = tree.node(tree.root);
        assert_eq!(root.kind, PoolKind::VirtualRoot);
        assert_eq!(root.children.len(), 2);

        let socket0 = tree.node(root.children[0]);
        assert!(socket0.system_nodes.contains(&SystemNodeId(2)) || tree
            .node(root.children[1])
            .system_nodes
            .contains(&SystemNodeId(2)));
    }

    #[test]
    fn depth_first_ids_increase_with_depth_order() {
        let fs = fs_two_socket_one_pmem();
        let topo = Discovery::new("/sys").discover(&fs).unwrap();
        let tree = Builder::build(topo).unwrap();
        assert_eq!(tree.node(tree.root).id, PoolId(0));
        assert!(tree.depth >= 1);
    }
}
