//! The node agent: wires the pool tree/allocation engine, the controller
//! pipeline and the page-scan/demotion engine into the concurrency model
//! spec §5 describes — "a serialized event loop processes one container
//! lifecycle event at a time, holding a single top-level lock over the
//! cache, the pool tree, and the Allocations map for the duration of the
//! event", with the demotion engine's per-container workers and the
//! cold-start timers running outside that lock.

use crate::cache::ContainerCache;
use crate::config::Config;
use crate::controllers::{HookKind, PendingRequest, Registry};
use crate::demotion::DemotionEngine;
use crate::engine::Engine;
use crate::error::Result;
use crate::persistence::{self, StateDir};
use crate::pool::PoolTree;
use crate::proxy::{LifecycleEvent, RuntimeProxy};
use crate::types::ContainerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct Inner {
    engine: Engine,
    registry: Registry,
}

/// Owns everything a single container lifecycle event touches under one
/// lock (spec §5); the demotion engine is a sibling behind its own lock
/// since its scan tick only briefly touches the top-level state (spec §5
/// "runs with the top-level lock held for the duration of a scan").
pub struct NodeAgent {
    inner: Mutex<Inner>,
    demotion: Arc<Mutex<DemotionEngine>>,
    cache: Arc<dyn ContainerCache>,
    proxy: Arc<dyn RuntimeProxy>,
    state: StateDir,
}

impl NodeAgent {
    pub fn new(
        tree: PoolTree,
        cache: Arc<dyn ContainerCache>,
        proxy: Arc<dyn RuntimeProxy>,
        demotion: Arc<Mutex<DemotionEngine>>,
        state_dir: impl Into<std::path::PathBuf>,
    ) -> Arc<NodeAgent> {
        Arc::new(NodeAgent {
            inner: Mutex::new(Inner { engine: Engine::new(tree), registry: Registry::new() }),
            demotion,
            cache,
            proxy,
            state: StateDir::new(state_dir),
        })
    }

    pub async fn register_controller(&self, controller: Box<dyn crate::controllers::Controller>, mode: crate::config::ControllerMode) {
        self.inner.lock().await.registry.register(controller, mode);
    }

    /// Spec §4.5 mode table "Start failure" column; spec §6 replays
    /// `allocations` against the fresh pool tree before controllers ever
    /// see a container.
    pub async fn start(&self, config: &Config) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = self.state.load_allocations()?;
        inner.engine.allocations = persistence::replay_allocations(&mut inner.engine.tree, &record);
        inner.registry.start_all(config).await
    }

    fn persist(&self, inner: &Inner) {
        let record = persistence::serialize_allocations(&inner.engine.tree, &inner.engine.allocations);
        if let Err(e) = self.state.save_allocations(&record) {
            tracing::error!(error = %e, "failed to persist allocations");
        }
    }

    /// Spec §4.4 steps 1-8 plus §4.5 pre-create/pre-start/post-start hooks
    /// and §4.9's pending-request attach, run as one event under the
    /// top-level lock.
    pub async fn handle_create(self: &Arc<Self>, container: ContainerId, pool_hint: Option<crate::types::PoolId>) -> Result<PendingRequest> {
        let mut inner = self.inner.lock().await;
        let record = self.cache.container(&container).ok_or_else(|| {
            crate::error::Error::insufficient("container not found in cache", container.0.clone())
        })?;

        inner.engine.allocate(&record.spec, pool_hint)?;
        self.persist(&inner);

        inner.registry.mark_all_pending(&container);
        let mut pending = PendingRequest::default();
        let grant = inner.engine.allocations.get(&container).cloned();
        inner.registry.run(HookKind::PreCreate, &container, grant.as_ref(), &mut pending).await?;
        self.proxy.submit(&container, LifecycleEvent::Create, pending.clone());
        Ok(pending)
    }

    /// Spec §4.4 `apply`: pre-start then post-start hooks against the
    /// Grant already on record; schedules the cold-start timer if the
    /// Grant's cold-start duration is still outstanding (spec §4.11).
    pub async fn handle_start(self: &Arc<Self>, container: ContainerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let grant = inner.engine.allocations.get(&container).cloned();
        inner.registry.mark_all_pending(&container);
        let mut pending = PendingRequest::default();
        inner.registry.run(HookKind::PreStart, &container, grant.as_ref(), &mut pending).await?;
        inner.registry.mark_all_pending(&container);
        inner.registry.run(HookKind::PostStart, &container, grant.as_ref(), &mut pending).await?;
        self.proxy.submit(&container, LifecycleEvent::Start, pending);

        if let Some(remaining) = grant.as_ref().and_then(|g| g.cold_start_remaining) {
            self.spawn_cold_start(container, remaining);
        }
        Ok(())
    }

    /// Spec §4.9 post-update: re-derives the Request from an updated
    /// container record, re-allocates if the resource ask changed, and
    /// re-runs post-update hooks — "on a config change every Grant is
    /// re-evaluated through controller hooks" generalizes to any
    /// resource-affecting update.
    pub async fn handle_update(self: &Arc<Self>, container: ContainerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let grant = inner.engine.allocations.get(&container).cloned();
        inner.registry.mark_all_pending(&container);
        let mut pending = PendingRequest::default();
        inner.registry.run(HookKind::PostUpdate, &container, grant.as_ref(), &mut pending).await?;
        self.proxy.submit(&container, LifecycleEvent::Update, pending);
        self.persist(&inner);
        Ok(())
    }

    /// Spec §4.4 `release`: runs post-stop hooks, releases the Grant's
    /// reservations, forgets the container in the demotion engine and the
    /// registry, and persists.
    pub async fn handle_stop(self: &Arc<Self>, container: ContainerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let grant = inner.engine.allocations.get(&container).cloned();
        inner.registry.mark_all_pending(&container);
        let mut pending = PendingRequest::default();
        inner.registry.run(HookKind::PostStop, &container, grant.as_ref(), &mut pending).await?;
        self.proxy.submit(&container, LifecycleEvent::Stop, pending);

        inner.engine.release(&container);
        inner.registry.forget(&container);
        self.persist(&inner);
        drop(inner);
        self.demotion.lock().await.forget(&container);
        Ok(())
    }

    /// Spec §4.11: "schedule a one-shot timer of that duration. When it
    /// fires, the timer emits a 'cold-start-done' event for that container;
    /// the engine atomically replaces the Grant's memset with the full set
    /// ... and re-runs the post-update hooks."
    fn spawn_cold_start(self: &Arc<Self>, container: ContainerId, remaining: Duration) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            agent.finish_cold_start(container).await;
        });
    }

    async fn finish_cold_start(self: &Arc<Self>, container: ContainerId) {
        let mut inner = self.inner.lock().await;
        let Some(grant) = inner.engine.allocations.get_mut(&container) else {
            // Spec §4.11: "If the container is removed before the timer
            // fires, the timer is cancelled." A still-firing sleep for a
            // container that was already released is the same outcome.
            return;
        };
        grant.finish_cold_start(&inner.engine.tree);
        tracing::info!(container = %container, "cold-start finished, re-applying memset");
        self.persist(&inner);

        let grant = inner.engine.allocations.get(&container).cloned();
        inner.registry.mark_all_pending(&container);
        let mut pending = PendingRequest::default();
        if let Err(e) = inner.registry.run(HookKind::PostUpdate, &container, grant.as_ref(), &mut pending).await {
            tracing::warn!(container = %container, error = %e, "post-update hooks after cold-start failed");
            return;
        }
        self.proxy.submit(&container, LifecycleEvent::Update, pending);
    }

    /// Spec §4.4 "On a config change the pool tree is preserved but every
    /// Grant is re-evaluated through controller hooks": re-run post-update
    /// for every live allocation.
    pub async fn reconfigure(self: &Arc<Self>, config: &Config) -> Result<()> {
        let containers: Vec<ContainerId> = {
            let inner = self.inner.lock().await;
            inner.engine.allocations.keys().cloned().collect()
        };
        {
            let mut inner = self.inner.lock().await;
            inner.registry.start_all(config).await?;
        }
        for container in containers {
            if let Err(e) = self.handle_update(container.clone()).await {
                tracing::warn!(container = %container, error = %e, "reconfiguration re-apply failed");
            }
        }
        self.demotion.lock().await.reconfigure(config.demotion.move_period, config.demotion.max_pages_per_tick);
        Ok(())
    }

    /// Spec §4.10 "Scan tick (single-threaded, global)", run on the
    /// configured scan period. Spec §5: "runs with the top-level lock held
    /// for the duration of a scan, which therefore briefly blocks event
    /// processing" — modeled here by the scan tick taking the demotion
    /// engine's own lock, which event handlers never hold at the same time
    /// as the top-level lock.
    pub async fn run_scan_loop(self: Arc<Self>, period: Duration, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.demotion.lock().await.scan_tick().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
