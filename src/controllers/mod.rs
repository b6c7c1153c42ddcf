//! Controller registry & hook pipeline (spec §4.5).
//!
//! A process-wide table of controllers, each with a declared operational
//! mode, run as ordered hooks around each container lifecycle transition.
//! Hooks run in alphabetical order by controller name within one
//! invocation, matching the teacher's async-first style for anything that
//! touches kernel surfaces.

pub mod blkio;
pub mod cache_rdt;
pub mod cpu;
pub mod memtier;
pub mod page_migration;
pub mod runtime_request;

use crate::config::{Config, ControllerMode};
use crate::error::{Error, Result};
use crate::grant::Grant;
use crate::types::ContainerId;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookKind {
    PreCreate,
    PreStart,
    PostStart,
    PostUpdate,
    PostStop,
}

/// A pending runtime request a pre-create/post-update hook may mutate
/// (spec §4.5, §4.9). Kept deliberately thin — the full orchestrator
/// protocol lives behind [`crate::proxy::RuntimeProxy`].
#[derive(Debug, Clone, Default)]
pub struct PendingRequest {
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub cpu_shares: Option<u64>,
    pub cpu_period_us: Option<u64>,
    pub cpu_quota_us: Option<i64>,
    pub annotations: BTreeMap<String, String>,
}

#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&mut self, config: &Config) -> Result<()> {
        let _ = config;
        Ok(())
    }

    async fn run_hook(
        &self,
        kind: HookKind,
        container: &ContainerId,
        grant: Option<&Grant>,
        pending: &mut PendingRequest,
    ) -> Result<()> {
        let _ = (kind, container, grant, pending);
        Ok(())
    }
}

struct Entry {
    controller: Box<dyn Controller>,
    mode: ControllerMode,
    running: bool,
}

/// Spec §4.5: "a process-wide table keyed by controller name." Spec §4.5:
/// "Each container carries a pending bitset of controller names."
pub struct Registry {
    entries: BTreeMap<&'static str, Entry>,
    pending: BTreeMap<ContainerId, BTreeSet<&'static str>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new(), pending: BTreeMap::new() }
    }

    pub fn register(&mut self, controller: Box<dyn Controller>, mode: ControllerMode) {
        let name = controller.name();
        self.entries.insert(name, Entry { controller, mode, running: false });
    }

    /// Spec §4.5 Mode table, "Start failure" column.
    pub async fn start_all(&mut self, config: &Config) -> Result<()> {
        let names: Vec<&'static str> = self.entries.keys().copied().collect();
        for name in names {
            let entry = self.entries.get_mut(name).expect("just listed");
            if entry.mode == ControllerMode::Disabled {
                continue;
            }
            match entry.controller.start(config).await {
                Ok(()) => entry.running = true,
                Err(e) => match entry.mode {
                    ControllerMode::Required => return Err(e),
                    _ => {
                        tracing::warn!(controller = name, error = %e, "controller failed to start, disabling");
                        entry.running = false;
                    }
                },
            }
        }
        Ok(())
    }

    pub fn mark_pending(&mut self, container: &ContainerId, controller: &'static str) {
        self.pending.entry(container.clone()).or_default().insert(controller);
    }

    pub fn mark_all_pending(&mut self, container: &ContainerId) {
        let names: Vec<&'static str> = self.entries.keys().copied().collect();
        self.pending.entry(container.clone()).or_default().extend(names);
    }

    /// Spec §4.5: "controllers execute in a stable alphabetical order."
    /// `BTreeMap` keyed by name already yields that order for free.
    pub async fn run(
        &mut self,
        kind: HookKind,
        container: &ContainerId,
        grant: Option<&Grant>,
        pending_request: &mut PendingRequest,
    ) -> Result<()> {
        let names: Vec<&'static str> = self.entries.keys().copied().collect();
        let bits = self.pending.get(container).cloned().unwrap_or_default();

        for name in names {
            if !bits.contains(name) {
                continue;
            }
            let entry = self.entries.get_mut(name).expect("just listed");
            if !entry.running || entry.mode == ControllerMode::Disabled {
                continue;
            }
            let result = entry.controller.run_hook(kind, container, grant, pending_request).await;
            if let Err(e) = result {
                match entry.mode {
                    ControllerMode::Required => return Err(e),
                    ControllerMode::Optional => {
                        tracing::error!(controller = name, error = %e, "optional controller failed, disabling");
                        entry.running = false;
                        return Err(e);
                    }
                    ControllerMode::Relaxed => {
                        tracing::warn!(controller = name, error = %e, "relaxed controller hook failed, continuing");
                    }
                    ControllerMode::Disabled => unreachable!(),
                }
            }
        }
        if let Some(set) = self.pending.get_mut(container) {
            set.clear();
        }
        Ok(())
    }

    pub fn forget(&mut self, container: &ContainerId) {
        self.pending.remove(container);
    }

    /// Count of registered controllers currently not running, grouped by
    /// mode, for the metrics snapshot (SPEC_FULL §10.5).
    pub fn failed_by_mode(&self) -> BTreeMap<ControllerMode, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            if !entry.running && entry.mode != ControllerMode::Disabled {
                *counts.entry(entry.mode).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn controller_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unsupported_if_absent(present: bool, knob: &str) -> Result<()> {
    if present {
        Ok(())
    } else {
        Err(Error::not_supported(format!("kernel knob absent: {knob}")))
    }
}
