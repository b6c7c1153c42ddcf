//! A workload's resource demand, derived from a container record (spec §3,
//! §4.1 `Request.new_from_container`).

use crate::error::{Error, Result};
use crate::types::{ContainerId, CpuKind, MemTypeMask, QosClass};
use std::collections::BTreeMap;
use std::time::Duration;

/// Annotations and limits pulled off a container record, the minimal slice
/// `Request::new_from_container` needs (spec §4.1). The full orchestrator
/// record lives behind [`crate::cache::ContainerRecord`]; this is just its
/// resource-relevant projection.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub id: ContainerId,
    pub namespace: String,
    pub qos: QosClass,
    /// Requested CPU, in milli-CPU units (1000 = one full core).
    pub cpu_milli: u32,
    /// Memory limit in bytes, if the container declares one.
    pub memory_limit_bytes: Option<u64>,
    /// Memory request in bytes, used when no limit is declared.
    pub memory_request_bytes: u64,
    pub annotations: BTreeMap<String, String>,
    /// Other containers this one is affine to, with a weight (spec §3
    /// "affinity-to-other-containers weights").
    pub affinity: BTreeMap<ContainerId, f64>,
    /// Topology hints: named score contributions looked up per-candidate
    /// pool by the scoring stage (spec §4.3 rule 4).
    pub topology_hints: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Isolated,
    Shared,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub container: ContainerId,
    pub qos: QosClass,
    pub cpu_kind: CpuKind,
    /// Whole CPUs requested exclusively.
    pub full: u32,
    /// Milli-CPU fraction requested from the shared/reserved pool.
    pub fraction: u32,
    pub isolation: Isolation,
    pub memory_amount: u64,
    pub memory_type_mask: MemTypeMask,
    pub affinity: BTreeMap<ContainerId, f64>,
    pub topology_hints: BTreeMap<String, f64>,
    pub cold_start: Option<Duration>,
}

const PREFER_SHARED_CPUS: &str = "prefer-shared-cpus";
const PREFER_ISOLATED_CPUS: &str = "prefer-isolated-cpus";
const MEMORY_TYPE: &str = "memory-type";
const COLD_START: &str = "cold-start-duration-seconds";

impl Request {
    /// Spec §4.1 `Request.new_from_container(c)`.
    pub fn new_from_container(c: &ContainerSpec) -> Result<Request> {
        let prefer_shared = annotation_bool(c, PREFER_SHARED_CPUS);
        let prefer_isolated = annotation_bool(c, PREFER_ISOLATED_CPUS);

        let (cpu_kind, full, fraction) = if c.namespace == "system" && c.cpu_milli > 0 {
            (CpuKind::Reserved, 0, c.cpu_milli)
        } else if c.qos == QosClass::Burstable || prefer_shared {
            (CpuKind::Normal, 0, c.cpu_milli)
        } else if c.qos == QosClass::Guaranteed {
            (CpuKind::Normal, c.cpu_milli / 1000, c.cpu_milli % 1000)
        } else {
            (CpuKind::Normal, 0, c.cpu_milli)
        };

        let isolation = if full == 1 || (full > 1 && prefer_isolated) {
            Isolation::Isolated
        } else {
            Isolation::Shared
        };

        let memory_amount = c.memory_limit_bytes.unwrap_or(c.memory_request_bytes);
        let memory_type_mask = c
            .annotations
            .get(MEMORY_TYPE)
            .map(|s| MemTypeMask::parse(s))
            .unwrap_or(MemTypeMask::ALL);

        let cold_start = match c.annotations.get(COLD_START) {
            None => None,
            Some(raw) => {
                let secs: i64 = raw.trim().parse().map_err(|_| {
                    Error::invalid_config(format!("cold-start duration `{raw}` is not an integer"), Some(COLD_START))
                })?;
                if secs <= 0 || secs > 3600 {
                    return Err(Error::invalid_config(
                        format!("cold-start duration must be in (0, 3600] seconds, got {secs}"),
                        Some(COLD_START),
                    ));
                }
                Some(Duration::from_secs(secs as u64))
            }
        };

        Ok(Request {
            container: c.id.clone(),
            qos: c.qos,
            cpu_kind,
            full,
            fraction,
            isolation,
            memory_amount,
            memory_type_mask,
            affinity: c.affinity.clone(),
            topology_hints: c.topology_hints.clone(),
            cold_start,
        })
    }
}

fn annotation_bool(c: &ContainerSpec, key: &str) -> bool {
    c.annotations.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(qos: QosClass) -> ContainerSpec {
        ContainerSpec {
            id: ContainerId::from("c1"),
            namespace: "default".into(),
            qos,
            cpu_milli: 2500,
            memory_limit_bytes: Some(1 << 30),
            memory_request_bytes: 1 << 29,
            annotations: BTreeMap::new(),
            affinity: BTreeMap::new(),
            topology_hints: BTreeMap::new(),
        }
    }

    #[test]
    fn system_namespace_routes_to_reserved_milli() {
        let mut c = base(QosClass::BestEffort);
        c.namespace = "system".into();
        let r = Request::new_from_container(&c).unwrap();
        assert!(matches!(r.cpu_kind, CpuKind::Reserved));
        assert_eq!(r.full, 0);
        assert_eq!(r.fraction, 2500);
    }

    #[test]
    fn guaranteed_splits_into_full_and_fraction() {
        let c = base(QosClass::Guaranteed);
        let r = Request::new_from_container(&c).unwrap();
        assert_eq!(r.full, 2);
        assert_eq!(r.fraction, 500);
    }

    #[test]
    fn single_full_cpu_is_isolated_by_default() {
        let mut c = base(QosClass::Guaranteed);
        c.cpu_milli = 1000;
        let r = Request::new_from_container(&c).unwrap();
        assert_eq!(r.full, 1);
        assert_eq!(r.isolation, Isolation::Isolated);
    }

    #[test]
    fn multi_full_cpu_stays_shared_without_explicit_preference() {
        let c = base(QosClass::Guaranteed);
        let r = Request::new_from_container(&c).unwrap();
        assert_eq!(r.isolation, Isolation::Shared);
    }

    #[test]
    fn multi_full_cpu_isolated_with_explicit_annotation() {
        let mut c = base(QosClass::Guaranteed);
        c.annotations.insert(PREFER_ISOLATED_CPUS.into(), "true".into());
        let r = Request::new_from_container(&c).unwrap();
        assert_eq!(r.isolation, Isolation::Isolated);
    }

    #[test]
    fn burstable_is_always_fractional() {
        let c = base(QosClass::Burstable);
        let r = Request::new_from_container(&c).unwrap();
        assert_eq!(r.full, 0);
        assert_eq!(r.fraction, 2500);
    }

    #[test]
    fn cold_start_out_of_range_fails() {
        let mut c = base(QosClass::Guaranteed);
        c.annotations.insert(COLD_START.into(), "0".into());
        assert!(Request::new_from_container(&c).is_err());
        c.annotations.insert(COLD_START.into(), "3601".into());
        assert!(Request::new_from_container(&c).is_err());
    }

    #[test]
    fn cold_start_within_range_parses() {
        let mut c = base(QosClass::Guaranteed);
        c.annotations.insert(COLD_START.into(), "120".into());
        let r = Request::new_from_container(&c).unwrap();
        assert_eq!(r.cold_start, Some(Duration::from_secs(120)));
    }
}
