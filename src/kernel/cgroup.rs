//! Cgroup knob access shared by the CPU, block-I/O, memory-toptier and
//! runtime-request controllers (spec §6).

use super::Fs;
use crate::error::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CgroupFile {
    root: PathBuf,
}

impl CgroupFile {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, cgroup: &Path, knob: &str) -> PathBuf {
        self.root.join(cgroup.strip_prefix("/").unwrap_or(cgroup)).join(knob)
    }

    pub fn exists(&self, fs: &dyn Fs, cgroup: &Path, knob: &str) -> bool {
        fs.exists(&self.path(cgroup, knob))
    }

    pub fn write(&self, fs: &dyn Fs, cgroup: &Path, knob: &str, value: &str) -> Result<()> {
        fs.write(&self.path(cgroup, knob), value)
    }

    pub fn read(&self, fs: &dyn Fs, cgroup: &Path, knob: &str) -> Result<String> {
        fs.read_to_string(&self.path(cgroup, knob))
    }

    pub fn write_cpuset_cpus(&self, fs: &dyn Fs, cgroup: &Path, cpus: &str) -> Result<()> {
        self.write(fs, cgroup, "cpuset.cpus", cpus)
    }

    pub fn write_cpuset_mems(&self, fs: &dyn Fs, cgroup: &Path, mems: &str) -> Result<()> {
        self.write(fs, cgroup, "cpuset.mems", mems)
    }

    pub fn write_cpu_shares(&self, fs: &dyn Fs, cgroup: &Path, shares: u64) -> Result<()> {
        self.write(fs, cgroup, "cpu.shares", &shares.to_string())
    }

    pub fn write_cpu_quota(&self, fs: &dyn Fs, cgroup: &Path, period_us: u64, quota_us: i64) -> Result<()> {
        self.write(fs, cgroup, "cpu.cfs_period_us", &period_us.to_string())?;
        self.write(fs, cgroup, "cpu.cfs_quota_us", &quota_us.to_string())
    }

    pub fn procs(&self, fs: &dyn Fs, cgroup: &Path) -> Result<Vec<u32>> {
        let text = self.read(fs, cgroup, "cgroup.procs")?;
        Ok(text
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .collect())
    }
}
