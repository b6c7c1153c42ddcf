//! Orchestrator-side container/pod cache (SPEC_FULL §10.6).
//!
//! Out of scope per spec.md §1 ("the orchestrator-side cache that stores
//! container/pod records and emits the lifecycle events" is an external
//! collaborator). This module is the seam the engine and controllers read
//! through to resolve QoS, namespace, annotations, and cgroup path — just
//! enough surface to drive the core in tests, not a protocol client.

use crate::request::ContainerSpec;
use crate::types::{ContainerId, QosClass};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct PodRecord {
    pub id: String,
    pub qos: QosClass,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub spec: ContainerSpec,
    pub pod_id: String,
    pub cgroup_path: PathBuf,
}

/// Lookup surface the engine and controllers need beyond what a `Grant`
/// already carries (spec §4.7 "effective class (container-assigned -> pod
/// QoS -> ...)", §4.10 "resolve the container's PID set from its cgroup's
/// `cgroup.procs`").
pub trait ContainerCache: Send + Sync {
    fn container(&self, id: &ContainerId) -> Option<ContainerRecord>;
    fn pod(&self, pod_id: &str) -> Option<PodRecord>;
}

/// Minimal in-memory implementation sufficient to exercise controllers and
/// the engine in tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    containers: RwLock<BTreeMap<ContainerId, ContainerRecord>>,
    pods: RwLock<BTreeMap<String, PodRecord>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_pod(&self, pod: PodRecord) {
        self.pods.write().unwrap().insert(pod.id.clone(), pod);
    }

    pub fn put_container(&self, record: ContainerRecord) {
        self.containers.write().unwrap().insert(record.spec.id.clone(), record);
    }

    pub fn remove_container(&self, id: &ContainerId) {
        self.containers.write().unwrap().remove(id);
    }
}

impl ContainerCache for InMemoryCache {
    fn container(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.containers.read().unwrap().get(id).cloned()
    }

    fn pod(&self, pod_id: &str) -> Option<PodRecord> {
        self.pods.read().unwrap().get(pod_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    #[test]
    fn round_trips_container_and_pod() {
        let cache = InMemoryCache::new();
        cache.put_pod(PodRecord { id: "pod1".into(), qos: QosClass::Guaranteed, annotations: Map::new() });
        cache.put_container(ContainerRecord {
            spec: ContainerSpec {
                id: ContainerId::from("c1"),
                namespace: "default".into(),
                qos: QosClass::Guaranteed,
                cpu_milli: 1000,
                memory_limit_bytes: None,
                memory_request_bytes: 1 << 20,
                annotations: Map::new(),
                affinity: Map::new(),
                topology_hints: Map::new(),
            },
            pod_id: "pod1".into(),
            cgroup_path: PathBuf::from("/kubepods/c1"),
        });
        let record = cache.container(&ContainerId::from("c1")).unwrap();
        assert_eq!(record.pod_id, "pod1");
        assert_eq!(cache.pod("pod1").unwrap().qos, QosClass::Guaranteed);
    }
}
