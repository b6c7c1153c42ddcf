//! Cache/RDT class controller (spec §2's sixth controller; not otherwise
//! detailed in spec.md). Assigns a container's PIDs to a resctrl resource
//! group whose cache-allocation bitmask is configured per class, the same
//! "class table + self-disable if the kernel surface is absent" shape as
//! the CPU controller's cpufreq/uncore handling.

use super::{Controller, HookKind, PendingRequest};
use crate::cache::ContainerCache;
use crate::config::Config;
use crate::error::Result;
use crate::grant::Grant;
use crate::kernel::cgroup::CgroupFile;
use crate::kernel::resctrl::Resctrl;
use crate::kernel::Fs;
use crate::types::ContainerId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct CacheRdtController {
    fs: Arc<dyn Fs>,
    cache: Arc<dyn ContainerCache>,
    cgroup: CgroupFile,
    resctrl: Resctrl,
    /// class name -> L3/L2 schemata line, written once at start.
    classes: BTreeMap<String, String>,
}

impl CacheRdtController {
    pub fn new(
        fs: Arc<dyn Fs>,
        cache: Arc<dyn ContainerCache>,
        cgroup_root: impl Into<std::path::PathBuf>,
        resctrl_root: impl Into<std::path::PathBuf>,
        classes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            cgroup: CgroupFile::new(cgroup_root),
            resctrl: Resctrl::new(resctrl_root),
            classes,
            fs,
            cache,
        }
    }

    fn class_for(&self, container: &ContainerId) -> Option<String> {
        let record = self.cache.container(container)?;
        let class = record.spec.annotations.get("cache-rdt-class")?;
        self.classes.contains_key(class).then(|| class.clone())
    }
}

#[async_trait]
impl Controller for CacheRdtController {
    fn name(&self) -> &'static str {
        "cache_rdt"
    }

    async fn start(&mut self, _config: &Config) -> Result<()> {
        if self.classes.is_empty() {
            return Ok(());
        }
        if !self.resctrl.present(self.fs.as_ref()) {
            return Err(crate::error::Error::not_supported("resctrl not mounted but a cache class is configured"));
        }
        for (class, schemata) in &self.classes {
            self.resctrl.set_schemata(self.fs.as_ref(), class, schemata)?;
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        kind: HookKind,
        container: &ContainerId,
        _grant: Option<&Grant>,
        _pending: &mut PendingRequest,
    ) -> Result<()> {
        if !matches!(kind, HookKind::PostStart) {
            return Ok(());
        }
        let Some(class) = self.class_for(container) else { return Ok(()) };
        let Some(record) = self.cache.container(container) else { return Ok(()) };
        for pid in self.cgroup.procs(self.fs.as_ref(), &record.cgroup_path)? {
            self.resctrl.assign_task(self.fs.as_ref(), &class, pid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ContainerRecord, InMemoryCache};
    use crate::kernel::fake::FakeFs;
    use crate::request::ContainerSpec;
    use crate::types::QosClass;
    use std::collections::BTreeMap as Map;

    #[tokio::test]
    async fn assigns_cgroup_pids_to_resctrl_tasks() {
        let fs = Arc::new(FakeFs::new());
        fs.set("/sys/fs/resctrl/schemata", "L3:0=fffff");
        fs.set("/sys/fs/cgroup/c1/cgroup.procs", "100\n101\n");
        let cache = Arc::new(InMemoryCache::new());
        let mut annotations = Map::new();
        annotations.insert("cache-rdt-class".to_string(), "gold".to_string());
        cache.put_container(ContainerRecord {
            spec: ContainerSpec {
                id: ContainerId::from("c1"),
                namespace: "default".into(),
                qos: QosClass::Guaranteed,
                cpu_milli: 1000,
                memory_limit_bytes: None,
                memory_request_bytes: 1 << 20,
                annotations,
                affinity: Map::new(),
                topology_hints: Map::new(),
            },
            pod_id: "pod1".into(),
            cgroup_path: std::path::PathBuf::from("/c1"),
        });
        let mut classes = BTreeMap::new();
        classes.insert("gold".to_string(), "L3:0=fff00".to_string());
        let mut controller = CacheRdtController::new(
            fs.clone() as Arc<dyn Fs>,
            cache as Arc<dyn ContainerCache>,
            "/sys/fs/cgroup",
            "/sys/fs/resctrl",
            classes,
        );
        controller.start(&Config::default()).await.unwrap();
        controller
            .run_hook(HookKind::PostStart, &ContainerId::from("c1"), None, &mut PendingRequest::default())
            .await
            .unwrap();
        assert_eq!(fs.read_to_string(&std::path::PathBuf::from("/sys/fs/resctrl/gold/tasks")).unwrap(), "101");
    }
}
