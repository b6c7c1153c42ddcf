//! The page-scan and demotion engine (spec §4.10).
//!
//! A global scan tick walks tracked containers and pushes a page-pool
//! snapshot to each one's long-lived worker task; workers move pages on
//! their own move-period tick. Per-container demotion state is a
//! cache-free copy (spec §3 "it is a cache-free copy: the engine never
//! reads the shared cache from its workers").

pub mod scan;
pub mod worker;

use crate::kernel::cgroup::CgroupFile;
use crate::kernel::movepages::PageMover;
use crate::kernel::procfs::ProcFs;
use crate::kernel::Fs;
use crate::types::{ContainerId, SystemNodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use worker::{DemotionWorker, WorkerMsg, WorkerParams};

struct Tracked {
    cgroup_path: PathBuf,
    source: BTreeSet<SystemNodeId>,
    target: BTreeSet<SystemNodeId>,
    tx: tokio::sync::mpsc::Sender<WorkerMsg>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct DemotionEngine {
    fs: Arc<dyn Fs>,
    procfs: ProcFs,
    cgroup: CgroupFile,
    mover: Arc<dyn PageMover>,
    tracked: BTreeMap<ContainerId, Tracked>,
    params: WorkerParams,
}

impl DemotionEngine {
    pub fn new(fs: Arc<dyn Fs>, proc_root: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>, mover: Arc<dyn PageMover>, move_period: Duration, max_pages_per_tick: u32) -> Self {
        Self {
            procfs: ProcFs::new(proc_root.into()),
            cgroup: CgroupFile::new(cgroup_root.into()),
            tracked: BTreeMap::new(),
            params: WorkerParams { move_period, max_pages_per_tick },
            fs,
            mover,
        }
    }

    /// Spec: "the page-migration controller registers the container with
    /// the demotion engine" once its Grant enables demotion (non-empty
    /// source and target sets).
    pub fn register(&mut self, container: ContainerId, cgroup_path: PathBuf, source: BTreeSet<SystemNodeId>, target: BTreeSet<SystemNodeId>) {
        if source.is_empty() || target.is_empty() {
            return;
        }
        let (tx, handle) = DemotionWorker::spawn(container.clone(), self.mover.clone(), self.params);
        self.tracked.insert(container, Tracked { cgroup_path, source, target, tx, handle });
    }

    /// Spec §4.10: "Container removal stops the specific worker before
    /// deletion."
    pub fn forget(&mut self, container: &ContainerId) {
        if let Some(tracked) = self.tracked.remove(container) {
            let _ = tracked.tx.try_send(WorkerMsg::Stop);
            tracked.handle.abort();
        }
    }

    /// Spec §4.10: "Reconfiguration stops all workers and restarts them
    /// with new timer values."
    pub fn reconfigure(&mut self, move_period: Duration, max_pages_per_tick: u32) {
        self.params = WorkerParams { move_period, max_pages_per_tick };
        let entries: Vec<(ContainerId, PathBuf, BTreeSet<SystemNodeId>, BTreeSet<SystemNodeId>)> = self
            .tracked
            .drain()
            .map(|(id, t)| {
                t.handle.abort();
                (id, t.cgroup_path, t.source, t.target)
            })
            .collect();
        for (id, cgroup_path, source, target) in entries {
            self.register(id, cgroup_path, source, target);
        }
    }

    /// Spec §4.10 "Scan tick (single-threaded, global)" steps 1-4.
    pub async fn scan_tick(&mut self) {
        let ids: Vec<ContainerId> = self.tracked.keys().cloned().collect();
        for id in ids {
            let Some(tracked) = self.tracked.get(&id) else { continue };
            let page_pool = match scan::scan_container(self.fs.as_ref(), &self.procfs, &self.cgroup, &tracked.cgroup_path, &tracked.source) {
                Ok(pool) => pool,
                Err(e) => {
                    tracing::warn!(container = %id, error = %e, "demotion scan failed for container");
                    continue;
                }
            };
            let target = tracked.target.clone();
            if tracked.tx.send(WorkerMsg::Snapshot { page_pool, target }).await.is_err() {
                tracing::warn!(container = %id, "demotion worker no longer receiving, forgetting");
                self.tracked.remove(&id);
            }
        }
    }

    pub fn tracked_containers(&self) -> impl Iterator<Item = &ContainerId> {
        self.tracked.keys()
    }
}

impl Drop for DemotionEngine {
    fn drop(&mut self) {
        for tracked in self.tracked.values() {
            tracked.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;
    use crate::kernel::movepages::fake::FakePageMover;

    #[tokio::test]
    async fn register_with_empty_target_is_not_tracked() {
        let fs: Arc<dyn Fs> = Arc::new(FakeFs::new());
        let mover: Arc<dyn PageMover> = Arc::new(FakePageMover::new());
        let mut engine = DemotionEngine::new(fs, "/proc", "/sys/fs/cgroup", mover, Duration::from_millis(10), 64);
        engine.register(ContainerId::from("c1"), PathBuf::from("/c1"), BTreeSet::from([SystemNodeId(0)]), BTreeSet::new());
        assert_eq!(engine.tracked_containers().count(), 0);
    }

    #[tokio::test]
    async fn register_and_forget_tracks_and_untracks() {
        let fs: Arc<dyn Fs> = Arc::new(FakeFs::new());
        let mover: Arc<dyn PageMover> = Arc::new(FakePageMover::new());
        let mut engine = DemotionEngine::new(fs, "/proc", "/sys/fs/cgroup", mover, Duration::from_millis(10), 64);
        let id = ContainerId::from("c1");
        engine.register(id.clone(), PathBuf::from("/c1"), BTreeSet::from([SystemNodeId(0)]), BTreeSet::from([SystemNodeId(1)]));
        assert_eq!(engine.tracked_containers().count(), 1);
        engine.forget(&id);
        assert_eq!(engine.tracked_containers().count(), 0);
    }
}
