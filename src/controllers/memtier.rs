//! Memory top-tier controller (spec §4.8): writes the granted top-tier
//! memory limit to a cgroup soft-limit knob, self-disabling if absent.

use super::{Controller, HookKind, PendingRequest};
use crate::cache::ContainerCache;
use crate::config::Config;
use crate::error::Result;
use crate::grant::Grant;
use crate::kernel::cgroup::CgroupFile;
use crate::kernel::Fs;
use crate::types::{ContainerId, MemoryTier};
use async_trait::async_trait;
use std::sync::Arc;

const SOFT_LIMIT_KNOB: &str = "memory.toptier_soft_limit_in_bytes";

pub struct MemTierController {
    fs: Arc<dyn Fs>,
    cache: Arc<dyn ContainerCache>,
    cgroup: CgroupFile,
    enabled: bool,
}

impl MemTierController {
    pub fn new(fs: Arc<dyn Fs>, cache: Arc<dyn ContainerCache>, cgroup_root: impl Into<std::path::PathBuf>) -> Self {
        Self { cgroup: CgroupFile::new(cgroup_root), fs, cache, enabled: false }
    }

    /// Fastest tier actually present in the Grant's per-tier limits: HBM
    /// beats DRAM beats PMEM.
    fn top_tier(grant: &Grant) -> Option<(MemoryTier, u64)> {
        for tier in [MemoryTier::Hbm, MemoryTier::Dram, MemoryTier::Pmem] {
            if let Some(&bytes) = grant.mem_limits.get(&tier) {
                return Some((tier, bytes));
            }
        }
        None
    }
}

#[async_trait]
impl Controller for MemTierController {
    fn name(&self) -> &'static str {
        "memtier"
    }

    /// Spec §4.8: "If the knob does not exist, the controller disables
    /// itself at start." The knob is a kernel feature flag, present (or
    /// not) uniformly across the cgroup hierarchy, so the root cgroup
    /// stands in for "any container's cgroup" here.
    async fn start(&mut self, _config: &Config) -> Result<()> {
        if !self.cgroup.exists(self.fs.as_ref(), std::path::Path::new("/"), SOFT_LIMIT_KNOB) {
            return Err(crate::error::Error::not_supported("memory.toptier_soft_limit_in_bytes absent"));
        }
        self.enabled = true;
        Ok(())
    }

    async fn run_hook(
        &self,
        _kind: HookKind,
        container: &ContainerId,
        grant: Option<&Grant>,
        _pending: &mut PendingRequest,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(grant) = grant else { return Ok(()) };
        let Some((_, bytes)) = Self::top_tier(grant) else { return Ok(()) };
        let Some(record) = self.cache.container(container) else { return Ok(()) };
        if !self.cgroup.exists(self.fs.as_ref(), &record.cgroup_path, SOFT_LIMIT_KNOB) {
            return Ok(());
        }
        self.cgroup.write(self.fs.as_ref(), &record.cgroup_path, SOFT_LIMIT_KNOB, &bytes.to_string())
    }
}
