//! Persisted state layout (spec §6).
//!
//! "A single state directory holds an allocations record as key/value
//! entries": `allocations` (cache-id -> cached grant) and `config` (the
//! last successfully applied configuration snapshot). On startup the pool
//! tree is rebuilt fresh and `allocations` is replayed by re-reserving each
//! Grant's supply from its named pool; entries whose pool or container no
//! longer exists are dropped with an error log (spec §6, testable property
//! 5 "serialization round-trip").

use crate::config::Config;
use crate::error::{Error, Result};
use crate::grant::{Allocations, Grant};
use crate::pool::PoolTree;
use crate::types::{ContainerId, CpuSet, MemTypeMask, MemoryTier, PoolId, SystemNodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Spec §6: "a cached grant is `{Exclusive: cpuset-string, Part: milli,
/// Container: cache-id, Pool: name, MemoryPool: name, MemType: comma-list of
/// DRAM|PMEM|HBM, Memset: id-set, MemoryLimit: {tier->bytes}, ColdStart:
/// nanoseconds}`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedGrant {
    pub container: String,
    pub pool: String,
    pub memory_pool: String,
    pub exclusive: String,
    pub reserved: String,
    pub part: u32,
    pub reserved_part: u32,
    pub mem_type: String,
    pub memset: Vec<u32>,
    pub memory_limit: BTreeMap<String, u64>,
    pub cold_start_nanos: Option<u64>,
}

impl CachedGrant {
    pub fn from_grant(tree: &PoolTree, grant: &Grant) -> CachedGrant {
        CachedGrant {
            container: grant.container.0.clone(),
            pool: tree.node(grant.cpu_pool).name.clone(),
            memory_pool: tree.node(grant.mem_pool).name.clone(),
            exclusive: grant.exclusive.to_range_string(),
            reserved: grant.reserved.to_range_string(),
            part: grant.shared_milli,
            reserved_part: grant.reserved_milli,
            mem_type: grant.mem_type_mask.to_annotation_string(),
            memset: grant.memset.iter().map(|id| id.0).collect(),
            memory_limit: grant.mem_limits.iter().map(|(tier, bytes)| (tier.name().to_string(), *bytes)).collect(),
            cold_start_nanos: grant.cold_start_remaining.map(|d| d.as_nanos() as u64),
        }
    }
}

/// The `allocations` entry: cache-id -> cached grant.
pub type AllocationsRecord = BTreeMap<String, CachedGrant>;

pub fn serialize_allocations(tree: &PoolTree, allocations: &Allocations) -> AllocationsRecord {
    allocations.iter().map(|(id, grant)| (id.0.clone(), CachedGrant::from_grant(tree, grant))).collect()
}

fn find_pool_by_name(tree: &PoolTree, name: &str) -> Option<PoolId> {
    tree.iter().find(|n| n.name == name).map(|n| n.id)
}

/// Spec §6 "replays `allocations` by re-reserving each Grant's supply from
/// its named pool. Entries whose pool or container no longer exists are
/// dropped with an error log."
pub fn replay_allocations(tree: &mut PoolTree, record: &AllocationsRecord) -> Allocations {
    let mut allocations = Allocations::new();
    for (container, cached) in record {
        match replay_one(tree, cached) {
            Ok(grant) => {
                allocations.insert(ContainerId(container.clone()), grant);
            }
            Err(e) => {
                tracing::error!(container = %container, error = %e, "dropping allocation that could not be replayed");
            }
        }
    }
    allocations
}

fn replay_one(tree: &mut PoolTree, cached: &CachedGrant) -> Result<Grant> {
    let cpu_pool = find_pool_by_name(tree, &cached.pool)
        .ok_or_else(|| Error::not_supported(format!("pool `{}` no longer exists", cached.pool)))?;
    let mem_pool = find_pool_by_name(tree, &cached.memory_pool)
        .ok_or_else(|| Error::not_supported(format!("memory pool `{}` no longer exists", cached.memory_pool)))?;

    let exclusive = CpuSet::parse_range_string(&cached.exclusive)?;
    let reserved = CpuSet::parse_range_string(&cached.reserved)?;
    let mem_type_mask = MemTypeMask::parse(&cached.mem_type);

    {
        let supply = &mut tree.node_mut(cpu_pool).supply;
        if !exclusive.is_empty() {
            supply.reserve_exact_whole(&exclusive, false);
        }
        if cached.part > 0 {
            supply.reserve_exact_shared_milli(cached.part);
        }
        if cached.reserved_part > 0 {
            supply.reserve_exact_reserved_milli(cached.reserved_part);
        }
    }

    let mut mem_limits = BTreeMap::new();
    for (name, bytes) in &cached.memory_limit {
        let tier = MemoryTier::parse(name)
            .ok_or_else(|| Error::invalid_config(format!("unknown memory tier `{name}` in persisted state"), None))?;
        mem_limits.insert(tier, *bytes);
    }
    for (&tier, &bytes) in &mem_limits {
        tree.node_mut(mem_pool).supply.reserve_memory_local(tier, bytes);
        for descendant in tree.descendants(mem_pool) {
            tree.node_mut(descendant).supply.add_extra_reservation(tier, bytes);
        }
    }

    let cold_start = cached.cold_start_nanos.map(Duration::from_nanos);
    let mut grant = Grant::new(
        tree,
        ContainerId(cached.container.clone()),
        cpu_pool,
        mem_pool,
        exclusive.clone(),
        exclusive,
        cached.part,
        reserved,
        cached.reserved_part,
        mem_type_mask,
        mem_limits,
        cold_start,
    );
    // The recomputed memset must re-equal the persisted one as a set
    // (testable property 5); recomputing from `mem_pool`/`mem_type_mask`
    // rather than trusting the stored `Memset` guards against a topology
    // change silently carrying forward a stale node id.
    let persisted: crate::types::Memset = cached.memset.iter().map(|id| SystemNodeId(*id)).collect();
    if grant.memset != persisted && grant.cold_start_remaining.is_none() {
        tracing::warn!(container = %grant.container, "replayed memset differs from persisted memset, topology likely changed");
    }
    Ok(grant)
}

/// Spec §6: "A single state directory holds an allocations record ... and
/// `config`: the last successfully applied configuration snapshot."
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn allocations_path(&self) -> PathBuf {
        self.root.join("allocations.json")
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn save_allocations(&self, record: &AllocationsRecord) -> Result<()> {
        self.write_atomic(&self.allocations_path(), record)
    }

    pub fn load_allocations(&self) -> Result<AllocationsRecord> {
        self.read_or_default(&self.allocations_path())
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        self.write_atomic(&self.config_path(), config)
    }

    pub fn load_config(&self) -> Result<Option<Config>> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::kernel_io(e.to_string(), "persistence", path.display().to_string()))?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::invalid_config(format!("corrupt persisted config: {e}"), None))
    }

    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| Error::kernel_io(e.to_string(), "persistence", self.root.display().to_string()))?;
        let tmp = path.with_extension("tmp");
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| Error::invalid_config(format!("serializing state: {e}"), None))?;
        std::fs::write(&tmp, text).map_err(|e| Error::kernel_io(e.to_string(), "persistence", tmp.display().to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::kernel_io(e.to_string(), "persistence", path.display().to_string()))?;
        Ok(())
    }

    fn read_or_default<T: for<'de> Deserialize<'de> + Default>(&self, path: &Path) -> Result<T> {
        if !path.exists() {
            return Ok(T::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::kernel_io(e.to_string(), "persistence", path.display().to_string()))?;
        serde_json::from_str(&text).map_err(|e| Error::invalid_config(format!("corrupt persisted state: {e}"), None))
    }
}
