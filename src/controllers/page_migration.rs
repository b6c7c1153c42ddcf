//! Page-migration controller (spec §2, §4.10): registers and unregisters
//! containers with the [`crate::demotion::DemotionEngine`] as their Grants
//! are applied and torn down. The scan/move loops themselves live in
//! `demotion`; this controller is only the bridge from lifecycle hooks to
//! that engine's per-container table.

use super::{Controller, HookKind, PendingRequest};
use crate::cache::ContainerCache;
use crate::config::Config;
use crate::demotion::DemotionEngine;
use crate::error::Result;
use crate::grant::Grant;
use crate::topology::Topology;
use crate::types::{ContainerId, MemoryTier, SystemNodeId};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct PageMigrationController {
    demotion: Arc<Mutex<DemotionEngine>>,
    cache: Arc<dyn ContainerCache>,
    topology: Arc<Topology>,
}

impl PageMigrationController {
    pub fn new(demotion: Arc<Mutex<DemotionEngine>>, cache: Arc<dyn ContainerCache>, topology: Arc<Topology>) -> Self {
        Self { demotion, cache, topology }
    }

    /// Split a Grant's memset into source (DRAM/HBM, fast) and target
    /// (PMEM, slow) node sets — "typically fast memory, e.g., DRAM" /
    /// "typically slow, e.g., PMEM" per spec §4.10.
    fn source_target(&self, grant: &Grant) -> (BTreeSet<SystemNodeId>, BTreeSet<SystemNodeId>) {
        let mut source = BTreeSet::new();
        let mut target = BTreeSet::new();
        for &id in &grant.memset {
            match self.topology.node(id).map(|n| n.memory_type) {
                Some(MemoryTier::Pmem) => {
                    target.insert(id);
                }
                Some(_) => {
                    source.insert(id);
                }
                None => {}
            }
        }
        (source, target)
    }
}

#[async_trait]
impl Controller for PageMigrationController {
    fn name(&self) -> &'static str {
        "page_migration"
    }

    async fn run_hook(
        &self,
        kind: HookKind,
        container: &ContainerId,
        grant: Option<&Grant>,
        _pending: &mut PendingRequest,
    ) -> Result<()> {
        match kind {
            HookKind::PostStart | HookKind::PostUpdate => {
                let Some(grant) = grant else { return Ok(()) };
                let Some(record) = self.cache.container(container) else { return Ok(()) };
                let (source, target) = self.source_target(grant);
                let mut demotion = self.demotion.lock().await;
                demotion.forget(container);
                demotion.register(container.clone(), record.cgroup_path, source, target);
            }
            HookKind::PostStop => {
                self.demotion.lock().await.forget(container);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ContainerRecord, InMemoryCache};
    use crate::kernel::fake::FakeFs;
    use crate::kernel::movepages::fake::FakePageMover;
    use crate::pool::Builder;
    use crate::request::ContainerSpec;
    use crate::topology::Discovery;
    use crate::types::{CpuSet, MemTypeMask, QosClass};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn registers_with_demotion_engine_on_post_start() {
        let fs: Arc<dyn crate::kernel::Fs> = Arc::new(FakeFs::new());
        let mover = Arc::new(FakePageMover::new());
        let demotion = Arc::new(Mutex::new(DemotionEngine::new(
            fs,
            "/proc",
            "/sys/fs/cgroup",
            mover,
            std::time::Duration::from_secs(5),
            64,
        )));
        let cache = Arc::new(InMemoryCache::new());
        cache.put_container(ContainerRecord {
            spec: ContainerSpec {
                id: ContainerId::from("c1"),
                namespace: "default".into(),
                qos: QosClass::Guaranteed,
                cpu_milli: 1000,
                memory_limit_bytes: None,
                memory_request_bytes: 1 << 20,
                annotations: BTreeMap::new(),
                affinity: BTreeMap::new(),
                topology_hints: BTreeMap::new(),
            },
            pod_id: "pod1".into(),
            cgroup_path: std::path::PathBuf::from("/c1"),
        });

        let fs2 = FakeFs::new();
        fs2.set("/sys/devices/system/node/node0/cpulist", "0-3\n");
        fs2.set("/sys/devices/system/node/node0/distance", "10 20\n");
        fs2.set("/sys/devices/system/node/node1/cpulist", "4-7\n");
        fs2.set("/sys/devices/system/node/node1/distance", "20 10\n");
        let topo = Arc::new(Discovery::new("/sys").discover(&fs2).unwrap());
        let tree = Builder::build((*topo).clone()).unwrap();

        let controller = PageMigrationController::new(demotion.clone(), cache, topo);
        let grant = Grant::new(
            &tree,
            ContainerId::from("c1"),
            tree.root,
            tree.root,
            CpuSet::new(),
            CpuSet::new(),
            0,
            CpuSet::new(),
            0,
            MemTypeMask::ALL,
            BTreeMap::new(),
            None,
        );
        controller
            .run_hook(HookKind::PostStart, &ContainerId::from("c1"), Some(&grant), &mut PendingRequest::default())
            .await
            .unwrap();
        assert_eq!(demotion.lock().await.tracked_containers().count(), 0);
    }
}
