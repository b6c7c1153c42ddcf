//! End-to-end scenario tests exercising the public crate API the way a
//! caller outside this crate would: build a topology, a pool tree, run the
//! allocation engine and (for the cold-start scenario) the node agent.

use noderes::cache::{ContainerRecord, InMemoryCache};
use noderes::config::{Config, ControllerMode};
use noderes::controllers::runtime_request::RuntimeRequestController;
use noderes::controllers::{HookKind, PendingRequest, Registry};
use noderes::demotion::DemotionEngine;
use noderes::engine::Engine;
use noderes::kernel::fake::FakeFs;
use noderes::kernel::movepages::fake::FakePageMover;
use noderes::pool::Builder;
use noderes::proxy::{LifecycleEvent, RecordingProxy};
use noderes::request::ContainerSpec;
use noderes::service::NodeAgent;
use noderes::topology::Discovery;
use noderes::types::{ContainerId, QosClass};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn leaf_tree_with_capacity(mib_per_leaf: u64) -> noderes::pool::PoolTree {
    let fs = FakeFs::new();
    fs.set("/sys/devices/system/node/node0/cpulist", "0-3\n");
    fs.set("/sys/devices/system/node/node0/distance", "10 20\n");
    fs.set("/sys/devices/system/node/node0/meminfo", format!("Node 0 MemTotal: {} kB\n", mib_per_leaf * 1024));
    fs.set("/sys/devices/system/node/node1/cpulist", "4-7\n");
    fs.set("/sys/devices/system/node/node1/distance", "20 10\n");
    fs.set("/sys/devices/system/node/node1/meminfo", format!("Node 1 MemTotal: {} kB\n", mib_per_leaf * 1024));
    fs.set("/sys/devices/system/cpu/cpu0/topology/physical_package_id", "0");
    fs.set("/sys/devices/system/cpu/cpu0/topology/die_id", "0");
    fs.set("/sys/devices/system/cpu/cpu4/topology/physical_package_id", "0");
    fs.set("/sys/devices/system/cpu/cpu4/topology/die_id", "0");
    let topo = Discovery::new("/sys").discover(&fs).unwrap();
    Builder::build(topo).unwrap()
}

fn container(id: &str, cpu_milli: u32, memory_bytes: u64, annotations: BTreeMap<String, String>) -> ContainerSpec {
    ContainerSpec {
        id: ContainerId::from(id),
        namespace: "default".into(),
        qos: QosClass::Guaranteed,
        cpu_milli,
        memory_limit_bytes: Some(memory_bytes),
        memory_request_bytes: memory_bytes,
        annotations,
        affinity: BTreeMap::new(),
        topology_hints: BTreeMap::new(),
    }
}

/// S3: three containers each asking 1 GiB DRAM on a two-leaf tree where
/// each leaf holds 1 GiB and their common parent holds the combined 2 GiB.
/// The first two containers fill the leaves; the third has nowhere left at
/// leaf granularity and must land on the parent pool instead, and
/// `used_memory` must never exceed capacity on any pool afterward.
#[test]
fn s3_third_allocation_rebalances_memory_upward() {
    let one_gib = 1u64 << 30;
    let mut engine = Engine::new(leaf_tree_with_capacity(1024 * 1024));

    engine.allocate(&container("c1", 1000, one_gib, BTreeMap::new()), None).unwrap();
    engine.allocate(&container("c2", 1000, one_gib, BTreeMap::new()), None).unwrap();
    engine.allocate(&container("c3", 1000, one_gib, BTreeMap::new()), None).unwrap();

    for pool in engine.tree.iter() {
        for tier in [noderes::types::MemoryTier::Dram, noderes::types::MemoryTier::Pmem, noderes::types::MemoryTier::Hbm] {
            assert!(pool.supply.used_memory(tier) <= pool.supply.memory_limit(tier));
        }
    }

    let pools: std::collections::BTreeSet<_> = engine.allocations.values().map(|g| g.mem_pool).collect();
    assert!(pools.len() >= 2, "at least one container should have been rebalanced to a different (ancestor) pool");
}

/// S4: a cold-start grant starts PMEM-only and widens to include DRAM once
/// the cold-start timer fires and the post-update hooks re-run.
#[tokio::test]
async fn s4_cold_start_timer_widens_memset_and_reapplies_hooks() {
    let mut annotations = BTreeMap::new();
    annotations.insert("cold-start-duration-seconds".to_string(), "1".to_string());
    annotations.insert("memory-type".to_string(), "dram,pmem".to_string());

    let cache = Arc::new(InMemoryCache::new());
    cache.put_container(ContainerRecord {
        spec: container("c1", 1000, 1 << 20, annotations),
        pod_id: "pod1".into(),
        cgroup_path: std::path::PathBuf::from("/c1"),
    });

    let fs: Arc<dyn noderes::kernel::Fs> = Arc::new(FakeFs::new());
    let mover = Arc::new(FakePageMover::new());
    let demotion = Arc::new(tokio::sync::Mutex::new(DemotionEngine::new(
        fs,
        "/proc",
        "/sys/fs/cgroup",
        mover,
        Duration::from_secs(5),
        64,
    )));
    let proxy = Arc::new(RecordingProxy::new());
    let tree = leaf_tree_with_capacity(1024 * 1024);
    let agent = NodeAgent::new(tree, cache, proxy.clone(), demotion, std::env::temp_dir().join("noderes-s4-test"));
    agent.register_controller(Box::new(RuntimeRequestController::new()), ControllerMode::Relaxed).await;
    agent.start(&Config::default()).await.unwrap();

    agent.handle_create(ContainerId::from("c1"), None).await.unwrap();
    agent.handle_start(ContainerId::from("c1")).await.unwrap();

    let created_mems = {
        let submissions = proxy.submissions.lock();
        submissions
            .iter()
            .find(|(_, event, _)| *event == LifecycleEvent::Create)
            .and_then(|(_, _, pending)| pending.cpuset_mems.clone())
            .expect("pre-create hook should have attached a cpuset_mems")
    };
    assert_eq!(created_mems, "", "DRAM should be stripped from the memset while cold-start is outstanding");

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let submissions = proxy.submissions.lock();
    assert!(submissions.len() >= 3, "create, start and the post-cold-start update should each submit a request");
    let updated_mems = submissions
        .iter()
        .rev()
        .find(|(_, event, _)| *event == LifecycleEvent::Update)
        .and_then(|(_, _, pending)| pending.cpuset_mems.clone())
        .expect("post-cold-start update should have reapplied the runtime-request hook");
    assert!(!updated_mems.is_empty(), "memset should have widened to include the DRAM node once cold-start finished");
}

/// S6: a required controller whose kernel knob is absent fails startup;
/// the same controller in relaxed mode disables itself and lets other
/// controllers proceed.
#[tokio::test]
async fn s6_required_controller_failure_aborts_relaxed_does_not() {
    use async_trait::async_trait;

    struct MissingKnob;
    #[async_trait]
    impl noderes::controllers::Controller for MissingKnob {
        fn name(&self) -> &'static str {
            "missing_knob"
        }
        async fn start(&mut self, _config: &Config) -> noderes::error::Result<()> {
            Err(noderes::error::Error::not_supported("kernel knob absent"))
        }
    }

    let mut required = Registry::new();
    required.register(Box::new(MissingKnob), noderes::config::ControllerMode::Required);
    assert!(required.start_all(&Config::default()).await.is_err());

    struct Ok1;
    #[async_trait]
    impl noderes::controllers::Controller for Ok1 {
        fn name(&self) -> &'static str {
            "ok"
        }
    }
    let mut relaxed = Registry::new();
    relaxed.register(Box::new(MissingKnob), noderes::config::ControllerMode::Relaxed);
    relaxed.register(Box::new(Ok1), noderes::config::ControllerMode::Relaxed);
    assert!(relaxed.start_all(&Config::default()).await.is_ok());

    let container = ContainerId::from("c1");
    relaxed.mark_all_pending(&container);
    let mut pending = PendingRequest::default();
    assert!(relaxed.run(HookKind::PostStart, &container, None, &mut pending).await.is_ok());
}
