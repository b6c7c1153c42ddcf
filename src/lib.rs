//! # noderes: topology-aware node resource manager
//!
//! `noderes` intercepts a container runtime's lifecycle events on a single
//! node and computes a CPU/memory placement that respects socket, die and
//! NUMA boundaries, then drives a set of kernel controllers (cpuset,
//! block-I/O class, CPU frequency, memory tiering, page migration, cache
//! allocation) to enforce that placement.
//!
//! ## Architecture
//!
//! ```text
//! noderesd
//! ├── topology      — one-shot discovery of sockets/dies/NUMA nodes/CPUs
//! ├── pool          — virtual-root/socket/die/NUMA tree built over the topology
//! ├── supply        — per-pool CPU and per-tier memory accounting
//! ├── request/grant — a container's resource ask, and the record of what it got
//! ├── scoring       — the strict pool-ordering comparator (spec scoring rules)
//! ├── engine        — allocate / rebalance / release over the pool tree
//! ├── controllers   — cpuset, blkio, cpufreq/uncore, memtier, page-migration, RDT
//! ├── demotion      — the page-scan and demotion engine controllers register with
//! ├── service       — wires the above into the lifecycle event loop
//! ├── persistence   — allocations/config state directory and startup replay
//! ├── kernel        — the `Fs` seam plus sysfs/procfs/cgroup/resctrl helpers
//! └── cache / proxy — the orchestrator-side collaborators this crate reads from
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use noderes::config::Config;
//! use noderes::kernel::RealFs;
//! use noderes::pool::Builder;
//! use noderes::topology::Discovery;
//! use std::sync::Arc;
//!
//! # fn main() -> noderes::error::Result<()> {
//! let config = Config::load(std::path::Path::new("/etc/noderesd/config.toml"))?;
//! let fs = RealFs;
//! let topology = Discovery::new(&config.kernel_paths.sysfs_root).discover(&fs)?;
//! let tree = Builder::build(topology)?;
//! let _ = Arc::new(tree);
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::type_complexity)]

pub mod cache;
pub mod config;
pub mod controllers;
pub mod demotion;
pub mod engine;
pub mod error;
pub mod grant;
pub mod kernel;
pub mod metrics;
pub mod persistence;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod scoring;
pub mod service;
pub mod supply;
pub mod topology;
pub mod types;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use grant::{Allocations, Grant};
pub use pool::PoolTree;
pub use request::{ContainerSpec, Request};
pub use service::NodeAgent;
pub use topology::Topology;
