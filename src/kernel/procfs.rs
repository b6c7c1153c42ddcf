//! `/proc/PID/{numa_maps,maps,pagemap,clear_refs}` parsing for the
//! page-scan/demotion engine (spec §4.10, Testable property 7).

use super::Fs;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;

pub const PAGE_SIZE: u64 = 4096;

const PM_SOFT_DIRTY: u64 = 1 << 55;
const PM_MMAP_EXCLUSIVE: u64 = 1 << 56;
const PM_PRESENT: u64 = 1 << 63;

#[derive(Debug, Clone)]
pub struct ProcFs {
    proc_root: PathBuf,
}

/// One VMA from `/proc/PID/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsRange {
    pub start: u64,
    pub end: u64,
    pub anonymous: bool,
}

/// One VMA from `/proc/PID/numa_maps`, keyed by the same start address as
/// its `MapsRange` counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaRange {
    pub start: u64,
    pub heap: bool,
    pub nodes: BTreeSet<u32>,
}

/// A VMA with both files' information merged, ready for idle-page
/// discovery.
#[derive(Debug, Clone)]
pub struct AnonHeapRange {
    pub start: u64,
    pub end: u64,
    pub nodes: BTreeSet<u32>,
}

impl ProcFs {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    pub fn read_maps(&self, fs: &dyn Fs, pid: u32) -> Result<Vec<MapsRange>> {
        let text = fs.read_to_string(&self.pid_dir(pid).join("maps"))?;
        Ok(parse_maps(&text))
    }

    pub fn read_numa_maps(&self, fs: &dyn Fs, pid: u32) -> Result<Vec<NumaRange>> {
        let text = fs.read_to_string(&self.pid_dir(pid).join("numa_maps"))?;
        Ok(parse_numa_maps(&text))
    }

    /// Merge `maps` and `numa_maps` into the anonymous-heap ranges that
    /// reference at least one node in `source` (spec §4.10.2.b).
    pub fn anon_heap_ranges(
        &self,
        fs: &dyn Fs,
        pid: u32,
        source: &BTreeSet<u32>,
    ) -> Result<Vec<AnonHeapRange>> {
        let maps = self.read_maps(fs, pid)?;
        let numa = self.read_numa_maps(fs, pid)?;
        let mut out = Vec::new();
        for m in &maps {
            if !m.anonymous {
                continue;
            }
            let Some(n) = numa.iter().find(|n| n.start == m.start) else {
                continue;
            };
            if !n.heap {
                continue;
            }
            if n.nodes.iter().any(|node| source.contains(node)) {
                out.push(AnonHeapRange {
                    start: m.start,
                    end: m.end,
                    nodes: n.nodes.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Read the pagemap word for one virtual address (spec §4.10.2.c).
    pub fn pagemap_entry(&self, fs: &dyn Fs, pid: u32, vaddr: u64) -> Result<u64> {
        let offset = (vaddr / PAGE_SIZE) * 8;
        let bytes = fs.read_at(&self.pid_dir(pid).join("pagemap"), offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| {
            Error::transient("short pagemap read")
        })?))
    }

    /// Select the addresses in `range` whose pagemap word is present,
    /// exclusively mapped, and not soft-dirty.
    pub fn idle_pages(&self, fs: &dyn Fs, pid: u32, range: &AnonHeapRange) -> Result<Vec<u64>> {
        let mut addrs = Vec::new();
        let mut vaddr = range.start - (range.start % PAGE_SIZE);
        while vaddr < range.end {
            match self.pagemap_entry(fs, pid, vaddr) {
                Ok(word) => {
                    if word & PM_PRESENT != 0
                        && word & PM_MMAP_EXCLUSIVE != 0
                        && word & PM_SOFT_DIRTY == 0
                    {
                        addrs.push(vaddr);
                    }
                }
                Err(e) if e.is_locally_recoverable() => {}
                Err(e) => return Err(e),
            }
            vaddr += PAGE_SIZE;
        }
        Ok(addrs)
    }

    /// Reset soft-dirty bits for the next scan round (spec §4.10.2.d).
    pub fn clear_refs(&self, fs: &dyn Fs, pid: u32) -> Result<()> {
        fs.write(&self.pid_dir(pid).join("clear_refs"), "4")
    }
}

fn parse_maps(text: &str) -> Vec<MapsRange> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        let Some((start, end)) = range.split_once('-') else { continue };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16)) else {
            continue;
        };
        // perms, offset, dev, inode consumed; a trailing path means file-backed.
        let _perms = fields.next();
        let _offset = fields.next();
        let _dev = fields.next();
        let _inode = fields.next();
        let path = fields.next();
        let anonymous = path.is_none();
        out.push(MapsRange { start, end, anonymous });
    }
    out
}

fn parse_numa_maps(text: &str) -> Vec<NumaRange> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(addr) = fields.next() else { continue };
        let Ok(start) = u64::from_str_radix(addr, 16) else { continue };
        let mut heap = false;
        let mut nodes = BTreeSet::new();
        for field in fields {
            if field == "heap" {
                heap = true;
            } else if let Some(rest) = field.strip_prefix('N') {
                if let Some((node, _count)) = rest.split_once('=') {
                    if let Ok(node) = node.parse() {
                        nodes.insert(node);
                    }
                }
            }
        }
        out.push(NumaRange { start, heap, nodes });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fake::FakeFs;

    #[test]
    fn parses_anonymous_vs_file_backed() {
        let text = "7f0000000000-7f0000001000 rw-p 00000000 00:00 0 \n\
                     7f0000001000-7f0000002000 r-xp 00000000 08:01 123 /usr/lib/libc.so\n";
        let ranges = parse_maps(text);
        assert!(ranges[0].anonymous);
        assert!(!ranges[1].anonymous);
    }

    #[test]
    fn parses_numa_maps_heap_and_nodes() {
        let text = "0060e000 default heap anon=3 dirty=3 N0=2 N1=1\n";
        let ranges = parse_numa_maps(text);
        assert!(ranges[0].heap);
        assert!(ranges[0].nodes.contains(&0));
        assert!(ranges[0].nodes.contains(&1));
    }

    #[test]
    fn idle_pages_require_present_exclusive_not_soft_dirty() {
        let fs = FakeFs::new();
        let proc = ProcFs::new("/proc");
        // page 0: present + exclusive, clean -> idle
        let word0 = PM_PRESENT | PM_MMAP_EXCLUSIVE;
        // page 1: present + exclusive + soft-dirty -> not idle
        let word1 = PM_PRESENT | PM_MMAP_EXCLUSIVE | PM_SOFT_DIRTY;
        // page 2: not present -> not idle
        let word2 = 0u64;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&word0.to_le_bytes());
        bytes.extend_from_slice(&word1.to_le_bytes());
        bytes.extend_from_slice(&word2.to_le_bytes());
        fs.set_binary("/proc/42/pagemap", bytes);
        let range = AnonHeapRange {
            start: 0,
            end: PAGE_SIZE * 3,
            nodes: BTreeSet::from([0]),
        };
        let idle = proc.idle_pages(&fs, 42, &range).unwrap();
        assert_eq!(idle, vec![0]);
    }
}
