//! Block device resolution for the block-I/O controller (spec §4.7, §6).
//!
//! Device specifications in the block-I/O class table are glob patterns
//! over `/dev`; symlinks are resolved, and character devices and partitions
//! are rejected.

use super::Fs;
use crate::error::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BlockDevices {
    dev_root: PathBuf,
    sysfs_root: PathBuf,
}

impl BlockDevices {
    pub fn new(dev_root: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self { dev_root: dev_root.into(), sysfs_root: sysfs_root.into() }
    }

    /// Expand a glob pattern (e.g. `/dev/disk/by-id/*SSD*`) against the
    /// `dev_root`'s directory listing, resolving symlinks and rejecting
    /// character devices and partitions.
    pub fn resolve_glob(&self, fs: &dyn Fs, pattern: &str) -> Result<Vec<ResolvedDevice>> {
        let re = glob_to_regex(pattern)?;
        let dir = Path::new(pattern)
            .parent()
            .unwrap_or(&self.dev_root)
            .to_path_buf();
        let mut out = Vec::new();
        for name in fs.read_dir_names(&dir)? {
            let candidate = dir.join(&name);
            let candidate_str = candidate.to_string_lossy();
            if !re.is_match(&candidate_str) {
                continue;
            }
            let resolved = if fs.exists(&candidate) {
                fs.read_link(&candidate).unwrap_or(candidate.clone())
            } else {
                candidate.clone()
            };
            if fs.is_char_device(&resolved).unwrap_or(false) {
                continue;
            }
            if self.is_partition(&resolved) {
                continue;
            }
            let (major, minor) = fs.major_minor(&resolved)?;
            out.push(ResolvedDevice { path: resolved, major, minor });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// A device is a partition if its basename ends in digits but its
    /// sysfs block entry has a `partition` file — approximated here by
    /// checking for a trailing digit, since whole disks under
    /// `/dev/disk/by-id` never end in a bare digit while partitions do
    /// (`...-part1`, `sda1`).
    fn is_partition(&self, path: &Path) -> bool {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        name.chars().last().is_some_and(|c| c.is_ascii_digit())
            && self.sysfs_root.join("class/block").join(&name).join("partition").exists()
    }

    /// Parse the active scheduler out of `sys/block/*/queue/scheduler`,
    /// which lists every available scheduler with the active one in
    /// brackets: `noop [mq-deadline] kyber bfq`.
    pub fn active_scheduler(&self, fs: &dyn Fs, device_name: &str) -> Result<String> {
        let path = self.sysfs_root.join("block").join(device_name).join("queue/scheduler");
        let text = fs.read_to_string(&path)?;
        for token in text.split_whitespace() {
            if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                return Ok(inner.to_string());
            }
        }
        Err(Error::kernel_io("no active scheduler bracketed", "blkio", path.display().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
}

impl ResolvedDevice {
    pub fn maj_min(&self) -> String {
        format!("{}:{}", self.major, self.minor)
    }
}

/// Translate a shell glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::invalid_config(format!("bad device glob `{pattern}`: {e}"), None))
}
