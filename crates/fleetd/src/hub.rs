//! Hub assembly — wires the store, the controllers and their queues.
//!
//! Both controllers are driven the same way: store change events and a
//! periodic full resync feed keys into a rate-limited work queue, and a
//! bounded worker pool reconciles them.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::HubConfig;
use fleet_metrics::HubMetrics;
use fleet_rollout::{BindingUpdater, ClusterUpdater, UpdateRunController};
use fleet_scheduler::{ClusterEligibilityChecker, Framework, Profile, Scheduler};
use fleet_state::{ObjectKey, StateStore};
use fleet_workqueue::{WorkQueue, default_controller_rate_limiter, run_workers};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::routing::{Route, route_event};

pub const SCHEDULER_QUEUE: &str = "placement-scheduler";
pub const ROLLOUT_QUEUE: &str = "update-run";

/// The assembled hub, ready to [`run`](Hub::run).
pub struct Hub {
    store: StateStore,
    config: HubConfig,
    metrics: Arc<HubMetrics>,
    updater: Arc<dyn ClusterUpdater>,
    scheduler_queue: Arc<WorkQueue<ObjectKey>>,
    rollout_queue: Arc<WorkQueue<ObjectKey>>,
}

impl Hub {
    pub fn new(store: StateStore, config: HubConfig, metrics: Arc<HubMetrics>) -> Self {
        let scheduler_queue = Arc::new(WorkQueue::new(
            SCHEDULER_QUEUE,
            Box::new(default_controller_rate_limiter(&config.placement.rate_limiter)),
        ));
        let rollout_queue = Arc::new(WorkQueue::new(
            ROLLOUT_QUEUE,
            Box::new(default_controller_rate_limiter(&config.placement.rate_limiter)),
        ));
        Self {
            updater: Arc::new(BindingUpdater::new(store.clone())),
            store,
            config,
            metrics,
            scheduler_queue,
            rollout_queue,
        }
    }

    /// Replace the default binding updater used by update runs.
    pub fn with_updater(mut self, updater: Arc<dyn ClusterUpdater>) -> Self {
        self.updater = updater;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    /// Run until `shutdown` flips to true, then drain the workers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let features = &self.config.features;
        let mut workers = Vec::new();

        if features.enable_resource_placement_apis {
            let scheduler = Scheduler::new(
                self.store.clone(),
                Framework::new(Profile::default_profile()),
                ClusterEligibilityChecker::new(Duration::from_secs(
                    self.config.cluster.unhealthy_threshold_secs,
                )),
                Arc::clone(&self.metrics),
            )
            .with_shutdown(shutdown.clone());
            let n = self.config.placement.max_concurrent_cluster_placement;
            workers.push(tokio::spawn(run_workers(
                Arc::clone(&self.scheduler_queue),
                Arc::new(scheduler),
                n,
            )));
            info!(workers = n, "placement scheduler started");
        } else {
            info!("resource placement APIs disabled, scheduler not started");
        }

        if features.enable_staged_update_run_apis {
            let controller = UpdateRunController::new(
                self.store.clone(),
                Arc::clone(&self.updater),
                Arc::clone(&self.metrics),
                &self.config.rollout,
            )
            .with_shutdown(shutdown.clone());
            let n = self.config.rollout.max_concurrent_update_runs;
            workers.push(tokio::spawn(run_workers(
                Arc::clone(&self.rollout_queue),
                Arc::new(controller),
                n,
            )));
            info!(workers = n, "update run controller started");
        } else {
            info!("staged update run APIs disabled, rollout controller not started");
        }

        let mut events = self.store.subscribe();
        let mut resync = tokio::time::interval(self.config.controller.resync_period());

        loop {
            tokio::select! {
                _ = resync.tick() => self.resync(),
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(route_event(&event)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "store events dropped, resyncing");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("store event channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("hub shutting down");
        self.scheduler_queue.shut_down();
        self.rollout_queue.shut_down();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "controller workers ended abnormally");
            }
        }
        Ok(())
    }

    fn dispatch(&self, route: Option<Route>) {
        match route {
            Some(Route::Placement(key)) => self.scheduler_queue.add(key),
            Some(Route::UpdateRun(key)) => self.rollout_queue.add(key),
            Some(Route::AllPlacements) => self.enqueue_placements(),
            None => {}
        }
    }

    fn enqueue_placements(&self) {
        match self.store.list_placements() {
            Ok(placements) => {
                for p in placements {
                    self.scheduler_queue.add(p.key());
                }
            }
            Err(e) => warn!(error = %e, "cannot list placements"),
        }
    }

    /// Queue every placement and update run.
    fn resync(&self) {
        self.enqueue_placements();
        match self.store.list_update_runs() {
            Ok(runs) => {
                for r in runs {
                    self.rollout_queue.add(r.key());
                }
            }
            Err(e) => warn!(error = %e, "cannot list update runs"),
        }
        debug!(
            placements = self.scheduler_queue.len(),
            update_runs = self.rollout_queue.len(),
            "resync queued"
        );
    }
}
