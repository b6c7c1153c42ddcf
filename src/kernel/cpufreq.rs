//! Per-CPU cpufreq scaling bounds (spec §4.6, §6).

use super::Fs;
use crate::error::Result;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CpuFreq {
    sysfs_root: PathBuf,
}

impl CpuFreq {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into() }
    }

    fn cpu_dir(&self, cpu: u32) -> PathBuf {
        self.sysfs_root
            .join("devices/system/cpu")
            .join(format!("cpu{cpu}"))
            .join("cpufreq")
    }

    pub fn exists(&self, fs: &dyn Fs, cpu: u32) -> bool {
        fs.exists(&self.cpu_dir(cpu))
    }

    pub fn set_min_khz(&self, fs: &dyn Fs, cpu: u32, khz: u64) -> Result<()> {
        fs.write(&self.cpu_dir(cpu).join("scaling_min_freq"), &khz.to_string())
    }

    pub fn set_max_khz(&self, fs: &dyn Fs, cpu: u32, khz: u64) -> Result<()> {
        fs.write(&self.cpu_dir(cpu).join("scaling_max_freq"), &khz.to_string())
    }

    pub fn get_min_khz(&self, fs: &dyn Fs, cpu: u32) -> Result<u64> {
        let s = fs.read_to_string(&self.cpu_dir(cpu).join("scaling_min_freq"))?;
        parse_khz(&s)
    }

    pub fn get_max_khz(&self, fs: &dyn Fs, cpu: u32) -> Result<u64> {
        let s = fs.read_to_string(&self.cpu_dir(cpu).join("scaling_max_freq"))?;
        parse_khz(&s)
    }
}

fn parse_khz(s: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| crate::error::Error::kernel_io(format!("bad frequency value `{s}`"), "cpu", "cpufreq"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;

    #[test]
    fn writes_and_reads_back() {
        let fs = FakeFs::new();
        let cf = CpuFreq::new("/sys");
        fs.set("/sys/devices/system/cpu/cpu0/cpufreq/scaling_min_freq", "800000");
        cf.set_max_khz(&fs, 0, 3200000).unwrap();
        assert_eq!(cf.get_min_khz(&fs, 0).unwrap(), 800000);
        assert_eq!(cf.get_max_khz(&fs, 0).unwrap(), 3200000);
    }
}
