//! The raw sysfs/cgroup/proc primitives the core calls.
//!
//! Out of scope per spec §1 ("specified only as the primitives the core
//! calls"): this module is intentionally thin wrappers, not a general VFS.
//! Everything above this layer goes through the [`Fs`] trait rather than
//! `std::fs` directly, so tests can substitute an in-memory root instead of
//! touching a real machine's `/sys` and `/proc` (spec §10.4 test tooling).

pub mod blockdev;
pub mod cgroup;
pub mod cpufreq;
pub mod movepages;
pub mod procfs;
pub mod resctrl;
pub mod uncore;

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Filesystem access seam used by every controller and by topology
/// discovery. `RealFs` roots at `/`; tests root at a `tempfile::TempDir`
/// populated with fixture files.
pub trait Fs: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn write(&self, path: &Path, contents: &str) -> Result<()>;
    fn read_dir_names(&self, path: &Path) -> Result<Vec<String>>;
    fn exists(&self, path: &Path) -> bool;
    fn read_link(&self, path: &Path) -> Result<PathBuf>;
    fn is_char_device(&self, path: &Path) -> Result<bool>;

    /// Read `len` bytes at `offset` — used for the binary `/proc/PID/pagemap`
    /// file, which `read_to_string` cannot represent.
    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// `(major, minor)` device numbers of a block device node, used to
    /// build `MAJ:MIN` throttle entries (spec §6).
    fn major_minor(&self, path: &Path) -> Result<(u32, u32)>;
}

/// Production implementation backed directly by the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl Fs for RealFs {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))
    }

    fn read_dir_names(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(path)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        std::fs::read_link(path)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))
    }

    fn is_char_device(&self, path: &Path) -> Result<bool> {
        use std::os::unix::fs::FileTypeExt;
        let meta = std::fs::metadata(path)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))?;
        Ok(meta.file_type().is_char_device())
    }

    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(path)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))?;
        Ok(buf)
    }

    fn major_minor(&self, path: &Path) -> Result<(u32, u32)> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path)
            .map_err(|e| Error::kernel_io(e.to_string(), "fs", path.display().to_string()))?;
        let rdev = meta.rdev();
        let major = (rdev >> 8) as u32 & 0xfff;
        let minor = (rdev & 0xff) as u32 | ((rdev >> 12) as u32 & !0xff);
        Ok((major, minor))
    }
}

/// In-memory fake used by unit tests (spec §10.4). Paths not present in the
/// map behave as if the knob does not exist, so controllers exercise their
/// `NotSupported` self-disable path the same way they would against a real
/// kernel missing that knob.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    pub struct FakeFs {
        files: Mutex<BTreeMap<PathBuf, String>>,
        binary: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
        symlinks: Mutex<BTreeMap<PathBuf, PathBuf>>,
        char_devices: Mutex<std::collections::BTreeSet<PathBuf>>,
        dev_numbers: Mutex<BTreeMap<PathBuf, (u32, u32)>>,
    }

    impl FakeFs {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
            self.files.lock().insert(path.into(), contents.into());
        }

        pub fn set_binary(&self, path: impl Into<PathBuf>, contents: Vec<u8>) {
            self.binary.lock().insert(path.into(), contents);
        }

        pub fn symlink(&self, path: impl Into<PathBuf>, target: impl Into<PathBuf>) {
            self.symlinks.lock().insert(path.into(), target.into());
        }

        pub fn mark_char_device(&self, path: impl Into<PathBuf>) {
            self.char_devices.lock().insert(path.into());
        }

        pub fn set_dev_numbers(&self, path: impl Into<PathBuf>, major: u32, minor: u32) {
            self.dev_numbers.lock().insert(path.into(), (major, minor));
        }
    }

    impl Fs for FakeFs {
        fn read_to_string(&self, path: &Path) -> Result<String> {
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::not_supported(format!("no fixture for {}", path.display())))
        }

        fn write(&self, path: &Path, contents: &str) -> Result<()> {
            self.files.lock().insert(path.to_path_buf(), contents.to_string());
            Ok(())
        }

        fn read_dir_names(&self, path: &Path) -> Result<Vec<String>> {
            let files = self.files.lock();
            let mut names: Vec<String> = files
                .keys()
                .filter_map(|p| p.strip_prefix(path).ok())
                .filter_map(|rel| rel.components().next())
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.lock().contains_key(path)
                || self.symlinks.lock().contains_key(path)
                || self.binary.lock().contains_key(path)
        }

        fn read_link(&self, path: &Path) -> Result<PathBuf> {
            self.symlinks
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::not_supported(format!("not a symlink: {}", path.display())))
        }

        fn is_char_device(&self, path: &Path) -> Result<bool> {
            Ok(self.char_devices.lock().contains(path))
        }

        fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
            let binary = self.binary.lock();
            let data = binary
                .get(path)
                .ok_or_else(|| Error::transient(format!("no fixture for {}", path.display())))?;
            let start = offset as usize;
            if start + len > data.len() {
                return Err(Error::transient(format!("read past end of {}", path.display())));
            }
            Ok(data[start..start + len].to_vec())
        }

        fn major_minor(&self, path: &Path) -> Result<(u32, u32)> {
            self.dev_numbers
                .lock()
                .get(path)
                .copied()
                .ok_or_else(|| Error::transient(format!("no device numbers for {}", path.display())))
        }
    }
}
