//! The global scan tick (spec §4.10 "Scan tick (single-threaded, global)").

use super::worker::{PagePool, PidPages};
use crate::kernel::cgroup::CgroupFile;
use crate::kernel::procfs::ProcFs;
use crate::kernel::Fs;
use crate::types::SystemNodeId;
use std::collections::BTreeSet;
use std::path::Path;

/// One container's scan result: its page pool plus the target set it was
/// captured against, ready to push to its worker (spec §4.10 step 3).
pub struct ScanResult {
    pub page_pool: PagePool,
    pub target: BTreeSet<SystemNodeId>,
}

/// Spec §4.10 steps 2a-d for a single tracked container.
pub fn scan_container(
    fs: &dyn Fs,
    procfs: &ProcFs,
    cgroup: &CgroupFile,
    cgroup_path: &Path,
    source: &BTreeSet<SystemNodeId>,
) -> crate::error::Result<PagePool> {
    let source_raw: BTreeSet<u32> = source.iter().map(|id| id.0).collect();
    let mut page_pool = PagePool::new();
    for pid in cgroup.procs(fs, cgroup_path)? {
        let ranges = match procfs.anon_heap_ranges(fs, pid, &source_raw) {
            Ok(ranges) => ranges,
            // A PID can exit between listing and reading; spec routes
            // kernel I/O failures per controller mode, but a vanished PID
            // mid-scan is locally recoverable — skip it this tick.
            Err(e) if e.is_locally_recoverable() => continue,
            Err(e) => return Err(e),
        };

        let mut addrs = Vec::new();
        let mut longest_range = 0usize;
        for range in &ranges {
            let idle = procfs.idle_pages(fs, pid, range)?;
            longest_range = longest_range.max(idle.len());
            addrs.extend(idle);
        }
        procfs.clear_refs(fs, pid)?;

        if !addrs.is_empty() {
            page_pool.insert(pid, PidPages { addrs, longest_range });
        }
    }
    Ok(page_pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;

    #[test]
    fn scan_collects_idle_pages_for_each_pid() {
        let fs = FakeFs::new();
        fs.set("/proc/c1cg/cgroup.procs", "42\n");
        fs.set(
            "/proc/42/maps",
            "7f0000000000-7f0000002000 rw-p 00000000 00:00 0 \n",
        );
        fs.set("/proc/42/numa_maps", "7f0000000000 default heap anon=2 N0=2\n");
        let word = 1u64 << 63 | 1u64 << 56;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&word.to_le_bytes());
        bytes.extend_from_slice(&word.to_le_bytes());
        fs.set_binary("/proc/42/pagemap", bytes);
        fs.set("/proc/42/clear_refs", "0");

        let cgroup = CgroupFile::new("/proc");
        let procfs = ProcFs::new("/proc");
        let source = BTreeSet::from([SystemNodeId(0)]);
        let page_pool = scan_container(&fs, &procfs, &cgroup, std::path::Path::new("/c1cg"), &source).unwrap();
        assert_eq!(page_pool.get(&42).unwrap().addrs.len(), 2);
    }
}
