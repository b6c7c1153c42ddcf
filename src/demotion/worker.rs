//! Per-container demotion worker (spec §4.10 "Per-container demotion
//! worker (long-lived, cooperative)").

use crate::kernel::movepages::PageMover;
use crate::types::{ContainerId, SystemNodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One PID's candidate idle pages plus the longest contiguous range seen,
/// used to keep a tick from stalling halfway through a range (spec §4.10).
#[derive(Debug, Clone, Default)]
pub struct PidPages {
    pub addrs: Vec<u64>,
    pub longest_range: usize,
}

pub type PagePool = BTreeMap<u32, PidPages>;

#[derive(Debug)]
pub enum WorkerMsg {
    /// Spec §4.10 step 3: "Push a snapshot `{page_pool, T}`".
    Snapshot { page_pool: PagePool, target: BTreeSet<SystemNodeId> },
    Stop,
}

/// Spec §4.10: "a global scan period; a global move period; a global max
/// pages per tick" drive every worker identically.
#[derive(Debug, Clone, Copy)]
pub struct WorkerParams {
    pub move_period: Duration,
    pub max_pages_per_tick: u32,
}

pub struct DemotionWorker {
    container: ContainerId,
    mover: Arc<dyn PageMover>,
    params: WorkerParams,
    rx: mpsc::Receiver<WorkerMsg>,
    page_pool: PagePool,
    target: BTreeSet<SystemNodeId>,
}

impl DemotionWorker {
    /// Spec's "unbuffered channel" (spec §4.10, §5) keeps the scan tick
    /// from overtaking itself; tokio's `mpsc` has no zero-capacity variant,
    /// so a single-slot channel stands in — the scan tick is itself
    /// serialized under the engine's top-level lock, so at most one
    /// snapshot is ever in flight regardless.
    pub fn spawn(container: ContainerId, mover: Arc<dyn PageMover>, params: WorkerParams) -> (mpsc::Sender<WorkerMsg>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let worker = DemotionWorker { container, mover, params, rx, page_pool: PagePool::new(), target: BTreeSet::new() };
        let handle = tokio::spawn(worker.run());
        (tx, handle)
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.params.move_period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.move_tick() {
                        tracing::warn!(container = %self.container, error = %e, "demotion move tick failed");
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(WorkerMsg::Snapshot { page_pool, target }) => {
                            self.page_pool = page_pool;
                            self.target = target;
                        }
                        Some(WorkerMsg::Stop) | None => break,
                    }
                }
            }
        }
    }

    /// Spec §4.10: "largest remaining list first": among PIDs not yet
    /// processed this tick, pick the one with the largest remaining page
    /// list and move at most `count` of its pages (never fewer than the
    /// longest contiguous range, so the tick cannot stall halfway through
    /// a range)."
    ///
    /// Open question 3 (spec §9): the `count = longest_range` override
    /// never feeds back into the interval length — preserved unadapted
    /// here, per the spec's documented decision to leave it that way.
    fn move_tick(&mut self) -> crate::error::Result<()> {
        let mut remaining: Vec<u32> = self.page_pool.iter().filter(|(_, p)| !p.addrs.is_empty()).map(|(pid, _)| *pid).collect();
        remaining.sort_by_key(|pid| std::cmp::Reverse(self.page_pool[pid].addrs.len()));

        let mut processed = BTreeSet::new();
        for pid in remaining {
            if processed.contains(&pid) {
                continue;
            }
            processed.insert(pid);
            let entry = self.page_pool.get_mut(&pid).expect("just listed");
            let count = (self.params.max_pages_per_tick as usize).max(entry.longest_range);
            let take = count.min(entry.addrs.len());
            let addrs: Vec<u64> = entry.addrs.drain(..take).collect();
            if addrs.is_empty() {
                continue;
            }

            let current = self.mover.discover_nodes(pid, &addrs)?;
            let mut to_move = Vec::new();
            let mut targets = Vec::new();
            for (addr, node) in addrs.iter().zip(current.iter()) {
                if !self.target.contains(&crate::types::SystemNodeId(*node as u32)) {
                    to_move.push(*addr);
                    targets.push(self.pick_target());
                }
            }
            if !to_move.is_empty() {
                self.mover.move_pages(pid, &to_move, &targets)?;
            }
        }
        Ok(())
    }

    /// Spec §4.10 step 2: "picking, per page, a random node from *T*
    /// (placeholder for a 'closest node' policy)".
    fn pick_target(&self) -> i32 {
        use rand::seq::IteratorRandom;
        self.target.iter().choose(&mut rand::thread_rng()).map(|id| id.0 as i32).unwrap_or(-1)
    }
}
