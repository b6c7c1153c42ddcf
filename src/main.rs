//! `noderesd`: the node resource manager binary (SPEC_FULL §10.1).
//!
//! Loads configuration, discovers the node's topology, builds the pool
//! tree, registers the controller pipeline and starts the demotion scan
//! loop and config-watch loop described in spec §5.

use noderes::cache::InMemoryCache;
use noderes::config::{Config, ConfigWatcher, FileMtimeWatcher};
use noderes::controllers::blkio::BlkioController;
use noderes::controllers::cache_rdt::CacheRdtController;
use noderes::controllers::cpu::{CpuClass, CpuController};
use noderes::controllers::memtier::MemTierController;
use noderes::controllers::page_migration::PageMigrationController;
use noderes::controllers::runtime_request::RuntimeRequestController;
use noderes::demotion::DemotionEngine;
use noderes::kernel::movepages::SyscallPageMover;
use noderes::kernel::RealFs;
use noderes::pool::Builder;
use noderes::proxy::RecordingProxy;
use noderes::service::NodeAgent;
use noderes::topology::Discovery;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn install_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> noderes::error::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/etc/noderesd/config.toml"));
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("failed to load {}: {e}, starting with defaults", config_path.display());
        Config::default()
    });

    install_tracing(&config.log_level);
    tracing::info!(config = %config_path.display(), "starting noderesd");

    let fs = Arc::new(RealFs);
    let topology = Arc::new(Discovery::new(&config.kernel_paths.sysfs_root).discover(fs.as_ref())?);
    let tree = Builder::build_with_reserved((*topology).clone(), &config.reserved_cpu_set()?)?;

    // Spec §4.6: a CPU class names the pools it applies to; resolve each to
    // the concrete CPUs owned by those pools now that the tree exists.
    let cpu_classes: Vec<CpuClass> = config
        .cpu_classes
        .values()
        .map(|entry| {
            let mut cpus = noderes::types::CpuSet::new();
            for pool_name in &entry.pools {
                match tree.pool_by_name(pool_name) {
                    Some(pool) => cpus = cpus.union(&pool.cpus(&tree)),
                    None => tracing::warn!(pool = %pool_name, "cpu class references unknown pool, ignoring"),
                }
            }
            CpuClass {
                min_khz: entry.min_freq_khz.unwrap_or(0) as u32,
                max_khz: entry.max_freq_khz.unwrap_or(0) as u32,
                uncore_min_khz: entry.uncore_min_freq_khz.unwrap_or(0) as u32,
                uncore_max_khz: entry.uncore_max_freq_khz.unwrap_or(0) as u32,
                cpus,
            }
        })
        .collect();
    let cpu_package_die = topology.cpu_package_die();

    // The orchestrator-side cache and the runtime-protocol proxy are the
    // two external collaborators this crate only defines a seam for
    // (`ContainerCache`, `RuntimeProxy`); a deployment wires in the real
    // client for its runtime instead of these in-memory stand-ins.
    let cache = Arc::new(InMemoryCache::new());
    let proxy = Arc::new(RecordingProxy::new());
    let mover = Arc::new(SyscallPageMover);
    let demotion = Arc::new(tokio::sync::Mutex::new(DemotionEngine::new(
        fs.clone() as Arc<dyn noderes::kernel::Fs>,
        &config.kernel_paths.proc_root,
        &config.kernel_paths.cgroup_root,
        mover,
        config.demotion.move_period,
        config.demotion.max_pages_per_tick,
    )));

    let agent = NodeAgent::new(tree, cache.clone(), proxy, demotion.clone(), &config.state_dir);

    agent
        .register_controller(
            Box::new(CpuController::new(fs.clone(), &config.kernel_paths.sysfs_root, cpu_classes, cpu_package_die)),
            config.controller_mode("cpu"),
        )
        .await;
    agent
        .register_controller(
            Box::new(BlkioController::new(
                fs.clone(),
                cache.clone(),
                &config.kernel_paths.dev_root,
                &config.kernel_paths.sysfs_root,
                &config.kernel_paths.cgroup_root,
                config.block_io_classes.clone(),
            )),
            config.controller_mode("blkio"),
        )
        .await;
    agent
        .register_controller(
            Box::new(MemTierController::new(fs.clone(), cache.clone(), &config.kernel_paths.cgroup_root)),
            config.controller_mode("memtier"),
        )
        .await;
    agent
        .register_controller(
            Box::new(CacheRdtController::new(
                fs.clone(),
                cache.clone(),
                &config.kernel_paths.cgroup_root,
                config.kernel_paths.sysfs_root.join("fs/resctrl"),
                config.cache_rdt_classes.clone(),
            )),
            config.controller_mode("cache_rdt"),
        )
        .await;
    agent
        .register_controller(Box::new(RuntimeRequestController::new()), config.controller_mode("runtime_request"))
        .await;
    agent
        .register_controller(
            Box::new(PageMigrationController::new(demotion.clone(), cache.clone(), topology.clone())),
            config.controller_mode("page_migration"),
        )
        .await;

    agent.start(&config).await?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let scan_agent = Arc::clone(&agent);
    let scan_period = config.demotion.scan_period;
    tokio::spawn(scan_agent.run_scan_loop(scan_period, stop_rx));

    let mut watcher = FileMtimeWatcher::new(&config_path);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                if let Some(new_config) = watcher.poll() {
                    tracing::info!("configuration changed, reconfiguring");
                    if let Err(e) = agent.reconfigure(&new_config).await {
                        tracing::error!(error = %e, "reconfiguration failed");
                    }
                }
            }
        }
    }

    let _ = stop_tx.send(true);
    Ok(())
}
