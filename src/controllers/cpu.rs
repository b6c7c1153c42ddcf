//! CPU controller (spec §4.6): cpuset/cpu-shares, per-CPU cpufreq class
//! bounds, and effective per-(package,die) uncore frequency bounds.

use super::{Controller, HookKind, PendingRequest};
use crate::config::Config;
use crate::error::Result;
use crate::grant::Grant;
use crate::kernel::cpufreq::CpuFreq;
use crate::kernel::uncore::Uncore;
use crate::kernel::Fs;
use crate::types::{memset_to_range_string, ContainerId, CpuSet};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-CPU-class frequency bounds (kHz), keyed by class name (spec §4.6
/// "for pools named in a CPU class table").
#[derive(Debug, Clone)]
pub struct CpuClass {
    pub min_khz: u32,
    pub max_khz: u32,
    pub uncore_min_khz: u32,
    pub uncore_max_khz: u32,
    pub cpus: CpuSet,
}

pub struct CpuController {
    fs: Arc<dyn Fs>,
    cpufreq: CpuFreq,
    uncore: Uncore,
    classes: Vec<CpuClass>,
    /// Every discovered CPU's owning (package, die), used to resolve the
    /// real uncore-frequency bucket a grant's CPUs fall into (spec §4.6
    /// "enforce the effective uncore min/max frequency on each
    /// (package, die)"), rather than a single synthetic bucket.
    cpu_package_die: BTreeMap<u32, (u32, u32)>,
    uncore_required: bool,
}

impl CpuController {
    pub fn new(
        fs: Arc<dyn Fs>,
        sysfs_root: impl Into<std::path::PathBuf>,
        classes: Vec<CpuClass>,
        cpu_package_die: BTreeMap<u32, (u32, u32)>,
    ) -> Self {
        let root = sysfs_root.into();
        Self {
            cpufreq: CpuFreq::new(root.clone()),
            uncore: Uncore::new(root),
            classes,
            cpu_package_die,
            uncore_required: false,
            fs,
        }
    }

    fn apply_cpufreq_classes(&self) -> Result<()> {
        for class in &self.classes {
            for cpu in &class.cpus.0 {
                self.cpufreq.set_min_khz(self.fs.as_ref(), *cpu, class.min_khz as u64)?;
                self.cpufreq.set_max_khz(self.fs.as_ref(), *cpu, class.max_khz as u64)?;
            }
        }
        Ok(())
    }

    /// Spec §4.6: "for dies whose assigned cpuset intersects an affected
    /// set of CPUs, enforce the effective uncore min/max frequency on each
    /// (package, die): the effective value is the per-class maximum of min
    /// (and of max) across all classes that have at least one CPU assigned
    /// on that die."
    fn effective_uncore_bounds(&self, grant: &Grant) -> BTreeMap<(u32, u32), (u32, u32)> {
        let affected = grant.exclusive.union(&grant.shared);
        let mut dies: std::collections::BTreeSet<(u32, u32)> = std::collections::BTreeSet::new();
        for cpu in &affected.0 {
            if let Some(&pd) = self.cpu_package_die.get(cpu) {
                dies.insert(pd);
            }
        }

        let mut out: BTreeMap<(u32, u32), (u32, u32)> = BTreeMap::new();
        for &(package, die) in &dies {
            let mut bounds: Option<(u32, u32)> = None;
            for class in &self.classes {
                let class_has_cpu_on_die =
                    class.cpus.0.iter().any(|cpu| self.cpu_package_die.get(cpu) == Some(&(package, die)));
                if class_has_cpu_on_die {
                    let (min, max) = bounds.get_or_insert((0, 0));
                    *min = (*min).max(class.uncore_min_khz);
                    *max = (*max).max(class.uncore_max_khz);
                }
            }
            if let Some(bounds) = bounds {
                out.insert((package, die), bounds);
            }
        }
        out
    }
}

#[async_trait]
impl Controller for CpuController {
    fn name(&self) -> &'static str {
        "cpu"
    }

    async fn start(&mut self, _config: &Config) -> Result<()> {
        let any_class_requests_uncore = self.classes.iter().any(|c| c.uncore_min_khz > 0 || c.uncore_max_khz > 0);
        if any_class_requests_uncore && !self.uncore.present(self.fs.as_ref()) {
            self.uncore_required = true;
            return Err(crate::error::Error::not_supported(
                "uncore frequency control requested by a CPU class but absent on this system",
            ));
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        kind: HookKind,
        _container: &ContainerId,
        grant: Option<&Grant>,
        pending: &mut PendingRequest,
    ) -> Result<()> {
        let Some(grant) = grant else { return Ok(()) };
        if !matches!(kind, HookKind::PostStart | HookKind::PostUpdate) {
            return Ok(());
        }

        let effective_cpus = if grant.exclusive.is_empty() { grant.shared.clone() } else { grant.exclusive.union(&grant.shared) };
        if !effective_cpus.is_empty() {
            pending.cpuset_cpus = Some(effective_cpus.to_range_string());
        }
        if !grant.reserved.is_empty() {
            pending.cpuset_cpus = Some(grant.reserved.to_range_string());
        }
        if grant.shared_milli > 0 {
            pending.cpu_shares = Some((grant.shared_milli as u64 * 1024) / 1000);
        }
        pending.cpuset_mems = Some(memset_to_range_string(&grant.memset));

        self.apply_cpufreq_classes()?;
        for ((package, die), (min_khz, max_khz)) in self.effective_uncore_bounds(grant) {
            self.uncore.set_min_khz(self.fs.as_ref(), package, die, min_khz as u64)?;
            self.uncore.set_max_khz(self.fs.as_ref(), package, die, max_khz as u64)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;
    use crate::types::MemTypeMask;

    fn fake_grant_with_cpus(cpus: &[u32]) -> Grant {
        Grant {
            container: ContainerId::from("c1"),
            cpu_pool: crate::types::PoolId(0),
            mem_pool: crate::types::PoolId(0),
            exclusive: CpuSet::from_iter(cpus.iter().copied()),
            shared: CpuSet::new(),
            shared_milli: 0,
            reserved: CpuSet::new(),
            reserved_milli: 0,
            memset: Default::default(),
            mem_type_mask: MemTypeMask::ALL,
            mem_limits: BTreeMap::new(),
            cold_start_remaining: None,
        }
    }

    #[tokio::test]
    async fn post_start_writes_effective_cpuset() {
        let fs: Arc<dyn Fs> = Arc::new(FakeFs::new());
        let controller = CpuController::new(fs, "/sys", Vec::new(), BTreeMap::new());
        let container = ContainerId::from("c1");
        let mut pending = PendingRequest::default();
        let grant = fake_grant_with_cpus(&[0, 1]);
        controller.run_hook(HookKind::PostStart, &container, Some(&grant), &mut pending).await.unwrap();
        assert_eq!(pending.cpuset_cpus.as_deref(), Some("0-1"));
    }

    #[tokio::test]
    async fn uncore_bounds_key_on_real_package_die_not_synthetic_zero() {
        let fs: Arc<dyn Fs> = Arc::new(FakeFs::new());
        fs.set("/sys/devices/system/cpu/intel_uncore_frequency/package_1_die_2/min_freq_khz", "0");
        fs.set("/sys/devices/system/cpu/intel_uncore_frequency/package_1_die_2/max_freq_khz", "0");
        let classes = vec![CpuClass {
            min_khz: 800_000,
            max_khz: 3_000_000,
            uncore_min_khz: 1_200_000,
            uncore_max_khz: 2_400_000,
            cpus: CpuSet::from_iter([0, 1]),
        }];
        let mut cpu_package_die = BTreeMap::new();
        cpu_package_die.insert(0, (1, 2));
        cpu_package_die.insert(1, (1, 2));
        let controller = CpuController::new(fs.clone(), "/sys", classes, cpu_package_die);
        let container = ContainerId::from("c1");
        let mut pending = PendingRequest::default();
        let grant = fake_grant_with_cpus(&[0, 1]);
        controller.run_hook(HookKind::PostStart, &container, Some(&grant), &mut pending).await.unwrap();

        assert_eq!(
            fs.read_to_string(std::path::Path::new(
                "/sys/devices/system/cpu/intel_uncore_frequency/package_1_die_2/min_freq_khz"
            ))
            .unwrap(),
            "1200000"
        );
        assert_eq!(
            fs.read_to_string(std::path::Path::new(
                "/sys/devices/system/cpu/intel_uncore_frequency/package_1_die_2/max_freq_khz"
            ))
            .unwrap(),
            "2400000"
        );
    }
}
