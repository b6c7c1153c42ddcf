//! Wrapper around the `move_pages(2)` syscall, the page relocation
//! primitive the demotion worker drives (spec §4.10, §6).

use crate::error::{Error, Result};

/// Seam over the actual syscall so the demotion worker can be tested
/// without root and without a NUMA-capable machine.
pub trait PageMover: Send + Sync {
    /// Query the current NUMA node of each address, passing a null target
    /// array (spec §4.10: "First call with a null target-node array ->
    /// discovers each candidate page's current node").
    fn discover_nodes(&self, pid: u32, addrs: &[u64]) -> Result<Vec<i32>>;

    /// Move each address to the corresponding entry in `target_nodes`.
    fn move_pages(&self, pid: u32, addrs: &[u64], target_nodes: &[i32]) -> Result<Vec<i32>>;
}

/// Production implementation: the real `move_pages(2)` syscall via libc.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallPageMover;

const MPOL_MF_MOVE: i32 = 1 << 1;

impl PageMover for SyscallPageMover {
    fn discover_nodes(&self, pid: u32, addrs: &[u64]) -> Result<Vec<i32>> {
        raw_move_pages(pid, addrs, None)
    }

    fn move_pages(&self, pid: u32, addrs: &[u64], target_nodes: &[i32]) -> Result<Vec<i32>> {
        raw_move_pages(pid, addrs, Some(target_nodes))
    }
}

#[cfg(target_os = "linux")]
fn raw_move_pages(pid: u32, addrs: &[u64], target_nodes: Option<&[i32]>) -> Result<Vec<i32>> {
    let count = addrs.len();
    let mut status = vec![0i32; count];
    let pages: Vec<*const libc::c_void> = addrs.iter().map(|a| *a as *const libc::c_void).collect();
    let (nodes_ptr, flags) = match target_nodes {
        Some(nodes) => (nodes.as_ptr(), MPOL_MF_MOVE),
        None => (std::ptr::null(), 0),
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            pid as libc::pid_t,
            count as libc::c_ulong,
            pages.as_ptr(),
            nodes_ptr,
            status.as_mut_ptr(),
            flags,
        )
    };
    if ret < 0 {
        return Err(Error::kernel_io(
            std::io::Error::last_os_error().to_string(),
            "page-migration",
            "move_pages",
        ));
    }
    Ok(status)
}

#[cfg(not(target_os = "linux"))]
fn raw_move_pages(_pid: u32, _addrs: &[u64], _target_nodes: Option<&[i32]>) -> Result<Vec<i32>> {
    Err(Error::not_supported("move_pages is only available on linux"))
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Tracks which node each address currently "lives on" without any real
    /// syscall, so the demotion worker's scheduling logic can be tested.
    #[derive(Debug, Default)]
    pub struct FakePageMover {
        pub locations: Mutex<BTreeMap<u64, i32>>,
    }

    impl FakePageMover {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn place(&self, addr: u64, node: i32) {
            self.locations.lock().insert(addr, node);
        }
    }

    impl PageMover for FakePageMover {
        fn discover_nodes(&self, _pid: u32, addrs: &[u64]) -> Result<Vec<i32>> {
            let locations = self.locations.lock();
            Ok(addrs.iter().map(|a| *locations.get(a).unwrap_or(&-1)).collect())
        }

        fn move_pages(&self, _pid: u32, addrs: &[u64], target_nodes: &[i32]) -> Result<Vec<i32>> {
            let mut locations = self.locations.lock();
            for (addr, node) in addrs.iter().zip(target_nodes.iter()) {
                locations.insert(*addr, *node);
            }
            Ok(target_nodes.to_vec())
        }
    }
}
