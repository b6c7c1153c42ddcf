//! Per-(package, die) uncore frequency bounds (spec §4.6, §6).

use super::Fs;
use crate::error::Result;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Uncore {
    sysfs_root: PathBuf,
}

impl Uncore {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into() }
    }

    fn die_dir(&self, package: u32, die: u32) -> PathBuf {
        self.sysfs_root
            .join("devices/system/cpu/intel_uncore_frequency")
            .join(format!("package_{package}_die_{die}"))
    }

    /// Whether uncore-frequency control exists on this system at all.
    /// Spec §4.6: "If uncore-frequency control is absent on the system but
    /// a class requests it, startup fails."
    pub fn present(&self, fs: &dyn Fs) -> bool {
        fs.exists(&self.sysfs_root.join("devices/system/cpu/intel_uncore_frequency"))
    }

    pub fn set_min_khz(&self, fs: &dyn Fs, package: u32, die: u32, khz: u64) -> Result<()> {
        fs.write(&self.die_dir(package, die).join("min_freq_khz"), &khz.to_string())
    }

    pub fn set_max_khz(&self, fs: &dyn Fs, package: u32, die: u32, khz: u64) -> Result<()> {
        fs.write(&self.die_dir(package, die).join("max_freq_khz"), &khz.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;

    #[test]
    fn absent_when_no_directory() {
        let fs = FakeFs::new();
        let u = Uncore::new("/sys");
        assert!(!u.present(&fs));
    }

    #[test]
    fn present_writes_bounds() {
        let fs = FakeFs::new();
        fs.set(
            "/sys/devices/system/cpu/intel_uncore_frequency/package_0_die_0/min_freq_khz",
            "1000000",
        );
        let u = Uncore::new("/sys");
        assert!(u.present(&fs));
        u.set_max_khz(&fs, 0, 0, 2400000).unwrap();
    }
}
