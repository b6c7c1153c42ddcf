//! Intel RDT / resctrl cache-allocation class support (spec §2 "cache/RDT
//! class" controller). Not detailed further in spec.md; the resctrl
//! pseudo-filesystem interface mirrors the uncore-frequency module's shape
//! (a directory per class, presence gates whether the feature exists at
//! all on this kernel).

use super::Fs;
use crate::error::Result;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Resctrl {
    root: PathBuf,
}

impl Resctrl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn class_dir(&self, class: &str) -> PathBuf {
        self.root.join(class)
    }

    /// Whether resctrl is mounted on this system at all.
    pub fn present(&self, fs: &dyn Fs) -> bool {
        fs.exists(&self.root.join("schemata"))
    }

    /// Write a class's cache-allocation bitmask line (e.g.
    /// `L3:0=fff00;1=00fff`) to its `schemata` file.
    pub fn set_schemata(&self, fs: &dyn Fs, class: &str, schemata: &str) -> Result<()> {
        fs.write(&self.class_dir(class).join("schemata"), schemata)
    }

    /// Assign a PID to a class's resource group by appending to its
    /// `tasks` file.
    pub fn assign_task(&self, fs: &dyn Fs, class: &str, pid: u32) -> Result<()> {
        fs.write(&self.class_dir(class).join("tasks"), &pid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;

    #[test]
    fn absent_when_not_mounted() {
        let fs = FakeFs::new();
        let r = Resctrl::new("/sys/fs/resctrl");
        assert!(!r.present(&fs));
    }

    #[test]
    fn present_writes_schemata_and_tasks() {
        let fs = FakeFs::new();
        fs.set("/sys/fs/resctrl/schemata", "L3:0=fffff");
        let r = Resctrl::new("/sys/fs/resctrl");
        assert!(r.present(&fs));
        r.set_schemata(&fs, "gold", "L3:0=fff00").unwrap();
        r.assign_task(&fs, "gold", 42).unwrap();
    }
}
