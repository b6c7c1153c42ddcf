//! Shared identifiers and small value types used across the crate.
//!
//! Kept deliberately thin: these are the vocabulary the topology, pool,
//! supply, request/grant and controller modules all speak, not a place for
//! behavior.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identity of a container as handed to us by the orchestrator-side cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        ContainerId(s.to_string())
    }
}

/// Identity of a [`crate::topology::SystemNode`] — a socket, die or NUMA
/// node discovered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SystemNodeId(pub u32);

impl fmt::Display for SystemNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a [`crate::pool::PoolNode`] inside the pool-tree arena.
///
/// The pool tree is built once at startup (and rebuilt wholesale on
/// topology-affecting reconfiguration) and referenced by index from then
/// on, per DESIGN NOTES §9 ("store pools in a single arena and reference
/// them by index").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub usize);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One memory tier in a heterogeneous-memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemoryTier {
    Dram,
    Pmem,
    Hbm,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 3] = [MemoryTier::Dram, MemoryTier::Pmem, MemoryTier::Hbm];

    pub fn name(self) -> &'static str {
        match self {
            MemoryTier::Dram => "dram",
            MemoryTier::Pmem => "pmem",
            MemoryTier::Hbm => "hbm",
        }
    }

    pub fn parse(s: &str) -> Option<MemoryTier> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dram" => Some(MemoryTier::Dram),
            "pmem" => Some(MemoryTier::Pmem),
            "hbm" => Some(MemoryTier::Hbm),
            _ => None,
        }
    }
}

/// A set of memory tiers, parsed from the comma-separated `memory-type`
/// annotation (spec §4.1) and used to filter candidate pools (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemTypeMask {
    bits: u8,
}

impl MemTypeMask {
    pub const NONE: MemTypeMask = MemTypeMask { bits: 0 };
    pub const ALL: MemTypeMask = MemTypeMask { bits: 0b111 };

    fn bit(tier: MemoryTier) -> u8 {
        match tier {
            MemoryTier::Dram => 0b001,
            MemoryTier::Pmem => 0b010,
            MemoryTier::Hbm => 0b100,
        }
    }

    pub fn single(tier: MemoryTier) -> MemTypeMask {
        MemTypeMask { bits: Self::bit(tier) }
    }

    pub fn contains(&self, tier: MemoryTier) -> bool {
        self.bits & Self::bit(tier) != 0
    }

    pub fn insert(&mut self, tier: MemoryTier) {
        self.bits |= Self::bit(tier);
    }

    pub fn remove(&mut self, tier: MemoryTier) {
        self.bits &= !Self::bit(tier);
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MemoryTier> + '_ {
        MemoryTier::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    /// Parse the comma-separated annotation form (`"dram,pmem"`), defaulting
    /// to [`MemTypeMask::ALL`] for an empty or absent value (spec §4.1).
    pub fn parse(s: &str) -> MemTypeMask {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return MemTypeMask::ALL;
        }
        let mut mask = MemTypeMask::NONE;
        for part in s.split(',') {
            if let Some(tier) = MemoryTier::parse(part) {
                mask.insert(tier);
            }
        }
        if mask.is_empty() {
            MemTypeMask::ALL
        } else {
            mask
        }
    }

    pub fn to_annotation_string(&self) -> String {
        self.iter().map(|t| t.name()).collect::<Vec<_>>().join(",")
    }
}

impl Default for MemTypeMask {
    fn default() -> Self {
        MemTypeMask::ALL
    }
}

/// Quality-of-service class of a workload, mirrored from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
    System,
}

/// Whether a request wants CPUs from the normal pool or the reserved slice
/// set aside for the system namespace (spec §4.1, Glossary "Reserved CPU").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuKind {
    Normal,
    Reserved,
}

/// An ordered, deduplicated set of CPU indices.
///
/// Backed by a `BTreeSet` so that iteration order is deterministic — the
/// allocation engine and controllers must be reproducible across runs
/// (spec §4.3, Testable property 3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSet(pub BTreeSet<u32>);

impl CpuSet {
    pub fn new() -> Self {
        CpuSet(BTreeSet::new())
    }

    pub fn from_iter(it: impl IntoIterator<Item = u32>) -> Self {
        CpuSet(it.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.union(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.intersection(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.difference(&other.0).copied().collect())
    }

    pub fn intersects(&self, other: &CpuSet) -> bool {
        self.0.intersection(&other.0).next().is_some()
    }

    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Render as the `cpuset.cpus`/cpufreq glob form: `"0-3,8,10-11"`.
    pub fn to_range_string(&self) -> String {
        let cpus: Vec<u32> = self.0.iter().copied().collect();
        let mut ranges = Vec::new();
        let mut i = 0;
        while i < cpus.len() {
            let start = cpus[i];
            let mut end = start;
            while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
                i += 1;
                end = cpus[i];
            }
            if start == end {
                ranges.push(format!("{start}"));
            } else {
                ranges.push(format!("{start}-{end}"));
            }
            i += 1;
        }
        ranges.join(",")
    }

    /// Parse the `cpulist`/`cpuset.cpus` range form (`"0-3,8,10-11"`).
    pub fn parse_range_string(s: &str) -> Result<CpuSet, crate::error::Error> {
        let mut set = BTreeSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(CpuSet(set));
        }
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((a, b)) = part.split_once('-') {
                let start: u32 = a.trim().parse().map_err(|_| {
                    crate::error::Error::invalid_config(format!("bad cpu range `{part}`"), None)
                })?;
                let end: u32 = b.trim().parse().map_err(|_| {
                    crate::error::Error::invalid_config(format!("bad cpu range `{part}`"), None)
                })?;
                for cpu in start..=end {
                    set.insert(cpu);
                }
            } else {
                let cpu: u32 = part.parse().map_err(|_| {
                    crate::error::Error::invalid_config(format!("bad cpu id `{part}`"), None)
                })?;
                set.insert(cpu);
            }
        }
        Ok(CpuSet(set))
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_range_string())
    }
}

/// An ordered, deduplicated set of NUMA node ids — the value written to
/// `cpuset.mems` (Glossary "Memset").
pub type Memset = BTreeSet<SystemNodeId>;

pub fn memset_to_range_string(memset: &Memset) -> String {
    CpuSet::from_iter(memset.iter().map(|n| n.0)).to_range_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpuset_range_round_trips() {
        let set = CpuSet::parse_range_string("0-3,8,10-11").unwrap();
        assert_eq!(set.to_range_string(), "0-3,8,10-11");
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn mem_type_mask_defaults_to_all() {
        assert_eq!(MemTypeMask::parse(""), MemTypeMask::ALL);
        assert_eq!(MemTypeMask::parse("all"), MemTypeMask::ALL);
    }

    #[test]
    fn mem_type_mask_parses_list() {
        let mask = MemTypeMask::parse("dram,pmem");
        assert!(mask.contains(MemoryTier::Dram));
        assert!(mask.contains(MemoryTier::Pmem));
        assert!(!mask.contains(MemoryTier::Hbm));
    }
}
