//! Metrics exposition (SPEC_FULL §10.5).
//!
//! A small gauge/counter snapshot refreshed on a polling tick and read
//! through a short-lived read lock, matching spec §5's "metrics-polling
//! tick (read-only; takes a short read lock on its own metrics cache)". No
//! HTTP endpoint lives here — only the snapshot type and the refresh.

use crate::config::ControllerMode;
use crate::engine::Engine;
use crate::controllers::Registry;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub pool_count: usize,
    pub allocation_count: usize,
    pub controller_count: usize,
    pub controller_failures_by_mode: BTreeMap<ControllerMode, usize>,
    pub demotion_tracked_containers: usize,
    pub demotion_pages_moved_total: u64,
}

/// Holds the last snapshot behind a `RwLock`; `refresh` is called from the
/// metrics-polling tick, `snapshot` is the read-only accessor other code
/// (or an eventual HTTP expositor) uses.
#[derive(Default)]
pub struct MetricsCache {
    current: RwLock<MetricsSnapshot>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.current.read().unwrap().clone()
    }

    pub fn refresh(&self, engine: &Engine, registry: &Registry, demotion_tracked: usize, pages_moved_total: u64) {
        let snapshot = MetricsSnapshot {
            pool_count: engine.tree.iter().count(),
            allocation_count: engine.allocations.len(),
            controller_count: registry.controller_count(),
            controller_failures_by_mode: registry.failed_by_mode(),
            demotion_tracked_containers: demotion_tracked,
            demotion_pages_moved_total: pages_moved_total,
        };
        *self.current.write().unwrap() = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;
    use crate::pool::Builder;
    use crate::topology::Discovery;

    fn tree_one_numa() -> crate::pool::PoolTree {
        let fs = FakeFs::new();
        fs.set("/sys/devices/system/node/node0/cpulist", "0-3\n");
        fs.set("/sys/devices/system/node/node0/distance", "10\n");
        fs.set("/sys/devices/system/node/node0/meminfo", "Node 0 MemTotal: 4194304 kB\n");
        let topo = Discovery::new("/sys").discover(&fs).unwrap();
        Builder::build(topo).unwrap()
    }

    #[test]
    fn refresh_populates_pool_and_controller_counts() {
        let engine = Engine::new(tree_one_numa());
        let registry = Registry::new();
        let cache = MetricsCache::new();
        cache.refresh(&engine, &registry, 0, 0);
        let snap = cache.snapshot();
        assert!(snap.pool_count >= 1);
        assert_eq!(snap.allocation_count, 0);
        assert_eq!(snap.controller_count, 0);
    }
}
