//! Block-I/O class controller (spec §4.7).

use super::{Controller, HookKind, PendingRequest};
use crate::cache::ContainerCache;
use crate::config::{BlockIoClassEntry, Config};
use crate::error::Result;
use crate::grant::Grant;
use crate::kernel::blockdev::BlockDevices;
use crate::kernel::cgroup::CgroupFile;
use crate::kernel::Fs;
use crate::types::{ContainerId, QosClass};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One resolved device's weight/throttle parameters, ready to write.
#[derive(Debug, Clone)]
struct DeviceParams {
    maj_min: String,
    weight: u32,
    read_bps: u64,
    write_bps: u64,
    read_iops: u64,
    write_iops: u64,
}

pub struct BlkioController {
    fs: Arc<dyn Fs>,
    cache: Arc<dyn ContainerCache>,
    devices: BlockDevices,
    cgroup: CgroupFile,
    classes: BTreeMap<String, Vec<BlockIoClassEntry>>,
}

impl BlkioController {
    pub fn new(
        fs: Arc<dyn Fs>,
        cache: Arc<dyn ContainerCache>,
        dev_root: impl Into<std::path::PathBuf>,
        sysfs_root: impl Into<std::path::PathBuf>,
        cgroup_root: impl Into<std::path::PathBuf>,
        classes: BTreeMap<String, Vec<BlockIoClassEntry>>,
    ) -> Self {
        let sysfs_root = sysfs_root.into();
        Self {
            devices: BlockDevices::new(dev_root, sysfs_root),
            cgroup: CgroupFile::new(cgroup_root),
            classes,
            fs,
            cache,
        }
    }

    /// Spec §4.7: "look up the effective class (container-assigned -> pod
    /// QoS -> `*` -> raw name)".
    fn effective_class(&self, container: &ContainerId) -> Option<String> {
        let record = self.cache.container(container)?;
        if let Some(assigned) = record.spec.annotations.get("block-io-class") {
            if self.classes.contains_key(assigned) {
                return Some(assigned.clone());
            }
        }
        let qos_name = match record.spec.qos {
            QosClass::Guaranteed => "guaranteed",
            QosClass::Burstable => "burstable",
            QosClass::BestEffort => "besteffort",
            QosClass::System => "system",
        };
        if self.classes.contains_key(qos_name) {
            return Some(qos_name.to_string());
        }
        if self.classes.contains_key("*") {
            return Some("*".to_string());
        }
        None
    }

    /// Resolve every device in a class to its weight/throttle parameters,
    /// warning (not failing) when the active scheduler isn't bfq/cfq (spec
    /// §4.7, testable scenario S5).
    fn resolve_params(&self, class: &str) -> Result<Vec<DeviceParams>> {
        let mut out = Vec::new();
        for entry in self.classes.get(class).into_iter().flatten() {
            for glob in &entry.devices {
                for resolved in self.devices.resolve_glob(self.fs.as_ref(), glob)? {
                    let device_name = resolved.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                    if let Ok(scheduler) = self.devices.active_scheduler(self.fs.as_ref(), &device_name) {
                        if scheduler != "bfq" && scheduler != "cfq" {
                            tracing::warn!(
                                device = %resolved.path.display(),
                                scheduler = %scheduler,
                                "device scheduler is neither bfq nor cfq, writing weight anyway"
                            );
                        }
                    }
                    out.push(DeviceParams {
                        maj_min: resolved.maj_min(),
                        weight: entry.weight,
                        read_bps: entry.throttle_read_bps,
                        write_bps: entry.throttle_write_bps,
                        read_iops: entry.throttle_read_iops,
                        write_iops: entry.throttle_write_iops,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Spec §6: "Fallback order: bfq then non-bfq" for weight, one line per
    /// device for throttle knobs.
    fn apply_to_cgroup(&self, cgroup_path: &std::path::Path, params: &[DeviceParams]) -> Result<()> {
        for p in params {
            let weight_line = format!("{} {}", p.maj_min, p.weight);
            if self.cgroup.exists(self.fs.as_ref(), cgroup_path, "blkio.bfq.weight_device") {
                self.cgroup.write(self.fs.as_ref(), cgroup_path, "blkio.bfq.weight_device", &weight_line)?;
            } else {
                self.cgroup.write(self.fs.as_ref(), cgroup_path, "blkio.weight_device", &weight_line)?;
            }
            if p.read_bps > 0 {
                self.cgroup.write(
                    self.fs.as_ref(),
                    cgroup_path,
                    "blkio.throttle.read_bps_device",
                    &format!("{} {}", p.maj_min, p.read_bps),
                )?;
            }
            if p.write_bps > 0 {
                self.cgroup.write(
                    self.fs.as_ref(),
                    cgroup_path,
                    "blkio.throttle.write_bps_device",
                    &format!("{} {}", p.maj_min, p.write_bps),
                )?;
            }
            if p.read_iops > 0 {
                self.cgroup.write(
                    self.fs.as_ref(),
                    cgroup_path,
                    "blkio.throttle.read_iops_device",
                    &format!("{} {}", p.maj_min, p.read_iops),
                )?;
            }
            if p.write_iops > 0 {
                self.cgroup.write(
                    self.fs.as_ref(),
                    cgroup_path,
                    "blkio.throttle.write_iops_device",
                    &format!("{} {}", p.maj_min, p.write_iops),
                )?;
            }
        }
        Ok(())
    }

    fn apply_for_container(&self, container: &ContainerId) -> Result<()> {
        let Some(record) = self.cache.container(container) else { return Ok(()) };
        let Some(class) = self.effective_class(container) else { return Ok(()) };
        let params = self.resolve_params(&class)?;
        self.apply_to_cgroup(&record.cgroup_path, &params)
    }

    /// Spec §4.7: "On reconfiguration, recompute the mapping and re-apply
    /// to every known running container, best-effort."
    pub fn reapply_all(&mut self, classes: BTreeMap<String, Vec<BlockIoClassEntry>>, known: &[ContainerId]) {
        self.classes = classes;
        for container in known {
            if let Err(e) = self.apply_for_container(container) {
                tracing::warn!(container = %container, error = %e, "best-effort blkio reapply failed");
            }
        }
    }
}

#[async_trait]
impl Controller for BlkioController {
    fn name(&self) -> &'static str {
        "blkio"
    }

    async fn start(&mut self, _config: &Config) -> Result<()> {
        Ok(())
    }

    async fn run_hook(
        &self,
        kind: HookKind,
        container: &ContainerId,
        _grant: Option<&Grant>,
        _pending: &mut PendingRequest,
    ) -> Result<()> {
        if !matches!(kind, HookKind::PostStart | HookKind::PostUpdate) {
            return Ok(());
        }
        self.apply_for_container(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ContainerRecord, InMemoryCache};
    use crate::config::BlockIoClassEntry;
    use crate::kernel::fake::FakeFs;
    use crate::request::ContainerSpec;
    use std::collections::BTreeMap as Map;

    fn entry(weight: u32, devices: Vec<&str>) -> BlockIoClassEntry {
        BlockIoClassEntry {
            weight,
            throttle_read_bps: 0,
            throttle_write_bps: 0,
            throttle_read_iops: 0,
            throttle_write_iops: 0,
            devices: devices.into_iter().map(String::from).collect(),
        }
    }

    fn setup() -> (Arc<FakeFs>, Arc<InMemoryCache>, BlkioController) {
        let fs = Arc::new(FakeFs::new());
        fs.set("/dev/disk/by-id/wwn-SSD0", "");
        fs.symlink("/dev/disk/by-id/wwn-SSD0", "/dev/sda");
        fs.set_dev_numbers("/dev/sda", 8, 0);
        fs.set("/sys/block/sda/queue/scheduler", "noop [mq-deadline] kyber bfq\n");

        let cache = Arc::new(InMemoryCache::new());
        cache.put_container(ContainerRecord {
            spec: ContainerSpec {
                id: ContainerId::from("c1"),
                namespace: "default".into(),
                qos: crate::types::QosClass::Guaranteed,
                cpu_milli: 1000,
                memory_limit_bytes: None,
                memory_request_bytes: 1 << 20,
                annotations: Map::new(),
                affinity: Map::new(),
                topology_hints: Map::new(),
            },
            pod_id: "pod1".into(),
            cgroup_path: std::path::PathBuf::from("/c1"),
        });

        let mut classes = BTreeMap::new();
        classes.insert("gold".to_string(), vec![entry(600, vec!["/dev/disk/by-id/*SSD*"])]);

        let controller = BlkioController::new(
            fs.clone() as Arc<dyn Fs>,
            cache.clone() as Arc<dyn ContainerCache>,
            "/dev",
            "/sys",
            "/sys/fs/cgroup",
            classes,
        );
        (fs, cache, controller)
    }

    #[tokio::test]
    async fn s5_weight_written_despite_non_bfq_scheduler() {
        let (fs, cache, controller) = setup();
        let record = cache.container(&ContainerId::from("c1")).unwrap();
        let mut spec = record.spec.clone();
        spec.annotations.insert("block-io-class".into(), "gold".into());
        cache.put_container(ContainerRecord { spec, pod_id: record.pod_id, cgroup_path: record.cgroup_path });

        controller
            .run_hook(HookKind::PostStart, &ContainerId::from("c1"), None, &mut PendingRequest::default())
            .await
            .unwrap();
        let written = fs.read_to_string(&std::path::PathBuf::from("/sys/fs/cgroup/c1/blkio.weight_device")).unwrap();
        assert_eq!(written, "8:0 600");
    }
}
