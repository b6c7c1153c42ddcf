//! Configuration surface (spec §6, §7; SPEC_FULL §10.3).
//!
//! Loaded from TOML on disk. `Config::validate` enforces the numeric
//! ranges spec.md §6 specifies and is run before a new configuration ever
//! replaces the running one — a rejected config never partially applies.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerMode {
    Disabled,
    Required,
    Optional,
    Relaxed,
}

impl Default for ControllerMode {
    fn default() -> Self {
        ControllerMode::Relaxed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIoClassEntry {
    pub weight: u32,
    #[serde(default)]
    pub throttle_read_bps: u64,
    #[serde(default)]
    pub throttle_write_bps: u64,
    #[serde(default)]
    pub throttle_read_iops: u64,
    #[serde(default)]
    pub throttle_write_iops: u64,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelPaths {
    pub sysfs_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
    pub dev_root: PathBuf,
}

impl Default for KernelPaths {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemotionConfig {
    #[serde(with = "humantime_secs")]
    pub scan_period: Duration,
    #[serde(with = "humantime_secs")]
    pub move_period: Duration,
    pub max_pages_per_tick: u32,
}

impl Default for DemotionConfig {
    fn default() -> Self {
        Self {
            scan_period: Duration::from_secs(30),
            move_period: Duration::from_secs(5),
            max_pages_per_tick: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controllers: BTreeMap<String, ControllerMode>,
    #[serde(default)]
    pub block_io_classes: BTreeMap<String, Vec<BlockIoClassEntry>>,
    /// Spec §3/§4.1: "the reserved subset is a configured slice of the
    /// node's CPUs", set aside for the system namespace. A CPU range
    /// string, e.g. `"0,4"` or `"0-1"`; empty means no CPU is reserved.
    #[serde(default)]
    pub reserved_cpus: String,
    /// Spec §4.6 "pools named in a 'CPU class' table": per-CPU-class
    /// frequency and uncore frequency bounds, keyed by pool name.
    #[serde(default)]
    pub cpu_classes: BTreeMap<String, CpuClassEntry>,
    /// Spec §2/§4.6's cache/RDT class table: per-class cache-allocation
    /// schemata, keyed by class name.
    #[serde(default)]
    pub cache_rdt_classes: BTreeMap<String, String>,
    #[serde(default)]
    pub kernel_paths: KernelPaths,
    #[serde(default)]
    pub demotion: DemotionConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One entry of the CPU-class table (spec §4.6): "for pools named in a 'CPU
/// class' table, enforce per-CPU minimum and maximum frequency ... for dies
/// whose assigned cpuset intersects an affected set of CPUs, enforce the
/// effective uncore min/max frequency."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuClassEntry {
    /// Pool names this class applies to.
    pub pools: Vec<String>,
    #[serde(default)]
    pub min_freq_khz: Option<u64>,
    #[serde(default)]
    pub max_freq_khz: Option<u64>,
    #[serde(default)]
    pub uncore_min_freq_khz: Option<u64>,
    #[serde(default)]
    pub uncore_max_freq_khz: Option<u64>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/noderesd")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controllers: BTreeMap::new(),
            block_io_classes: BTreeMap::new(),
            reserved_cpus: String::new(),
            cpu_classes: BTreeMap::new(),
            cache_rdt_classes: BTreeMap::new(),
            kernel_paths: KernelPaths::default(),
            demotion: DemotionConfig::default(),
            state_dir: default_state_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid_config(format!("reading {}: {e}", path.display()), None))?;
        let config: Config =
            toml::from_str(&text).map_err(|e| Error::invalid_config(format!("parsing {}: {e}", path.display()), None))?;
        config.validate()?;
        Ok(config)
    }

    /// Spec §6: "each numeric parsed as a quantity in the range specified
    /// per-field (weight 10..1000; rates >= 0)." Spec §7: "InvalidConfig
    /// never partially applies."
    pub fn validate(&self) -> Result<()> {
        for (class, entries) in &self.block_io_classes {
            for entry in entries {
                if !(10..=1000).contains(&entry.weight) {
                    return Err(Error::invalid_config(
                        format!("block-io class `{class}` weight {} outside 10..=1000", entry.weight),
                        Some("block_io_classes"),
                    ));
                }
                if entry.devices.is_empty() {
                    return Err(Error::invalid_config(
                        format!("block-io class `{class}` has no device globs"),
                        Some("block_io_classes"),
                    ));
                }
            }
        }
        if self.demotion.max_pages_per_tick == 0 {
            return Err(Error::invalid_config("demotion.max_pages_per_tick must be > 0", Some("demotion")));
        }
        self.reserved_cpu_set()?;
        for (class, entry) in &self.cpu_classes {
            if let (Some(min), Some(max)) = (entry.min_freq_khz, entry.max_freq_khz) {
                if min > max {
                    return Err(Error::invalid_config(
                        format!("cpu class `{class}` min_freq_khz {min} exceeds max_freq_khz {max}"),
                        Some("cpu_classes"),
                    ));
                }
            }
            if let (Some(min), Some(max)) = (entry.uncore_min_freq_khz, entry.uncore_max_freq_khz) {
                if min > max {
                    return Err(Error::invalid_config(
                        format!("cpu class `{class}` uncore_min_freq_khz {min} exceeds uncore_max_freq_khz {max}"),
                        Some("cpu_classes"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn controller_mode(&self, name: &str) -> ControllerMode {
        self.controllers.get(name).copied().unwrap_or_default()
    }

    /// Parses [`Config::reserved_cpus`] into a [`crate::types::CpuSet`]
    /// (spec §3: "the reserved subset is a configured slice of the node's
    /// CPUs"). Empty string parses to the empty set.
    pub fn reserved_cpu_set(&self) -> Result<crate::types::CpuSet> {
        if self.reserved_cpus.trim().is_empty() {
            Ok(crate::types::CpuSet::new())
        } else {
            crate::types::CpuSet::parse_range_string(&self.reserved_cpus)
        }
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Spec §10.3 (SPEC_FULL): "a `ConfigWatcher` trait plus a polling
/// file-mtime implementation that emits a `ConfigChanged` event."
pub trait ConfigWatcher: Send + Sync {
    /// Returns `Some(new_config)` if the watched source changed since the
    /// last poll and the new content parses and validates; `None` if
    /// unchanged. A parse/validate failure is logged and treated as
    /// unchanged, per §7 "never partially applies."
    fn poll(&mut self) -> Option<Config>;
}

pub struct FileMtimeWatcher {
    path: PathBuf,
    last_mtime: Option<std::time::SystemTime>,
}

impl FileMtimeWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), last_mtime: None }
    }
}

impl ConfigWatcher for FileMtimeWatcher {
    fn poll(&mut self) -> Option<Config> {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        if Some(mtime) == self.last_mtime {
            return None;
        }
        match Config::load(&self.path) {
            Ok(config) => {
                self.last_mtime = Some(mtime);
                Some(config)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "config reload rejected, keeping previous");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_weight_rejected() {
        let mut config = Config::default();
        config.block_io_classes.insert(
            "gold".to_string(),
            vec![BlockIoClassEntry {
                weight: 5,
                throttle_read_bps: 0,
                throttle_write_bps: 0,
                throttle_read_iops: 0,
                throttle_write_iops: 0,
                devices: vec!["/dev/sda".to_string()],
            }],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn controller_mode_defaults_to_relaxed() {
        assert_eq!(Config::default().controller_mode("cpu"), ControllerMode::Relaxed);
    }
}
