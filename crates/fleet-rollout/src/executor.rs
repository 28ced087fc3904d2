//! Cluster update dispatch.
//!
//! [`execute_stage`] runs the cluster updates of one stage with bounded
//! concurrency. A stop check runs before each dispatch; updates already in
//! flight are always awaited.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use fleet_state::{BindingState, StateStore};
use fleet_workqueue::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// One cluster update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterUpdateRequest {
    pub namespace: Option<String>,
    pub run_name: String,
    pub placement_name: String,
    pub stage: String,
    pub cluster: String,
}

/// Applies the placement's resources to one cluster. Must be idempotent: a
/// crash between dispatch and the status write re-dispatches the update.
pub trait ClusterUpdater: Send + Sync + 'static {
    fn update_cluster(&self, request: ClusterUpdateRequest) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Marks the cluster's binding `Bound` and stamps the run on it.
#[derive(Clone)]
pub struct BindingUpdater {
    store: StateStore,
    max_attempts: u32,
}

impl BindingUpdater {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    fn bind(&self, req: &ClusterUpdateRequest) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut binding = self
                .store
                .get_binding(req.namespace.as_deref(), &req.placement_name, &req.cluster)
                .context("reading binding")?
                .ok_or_else(|| anyhow!("no binding for cluster {}", req.cluster))?;
            match binding.state {
                BindingState::Unscheduled => {
                    return Err(anyhow!("binding for cluster {} is no longer scheduled", req.cluster));
                }
                BindingState::Bound if binding.update_run.as_deref() == Some(req.run_name.as_str()) => {
                    return Ok(());
                }
                _ => {}
            }
            binding.state = BindingState::Bound;
            binding.update_run = Some(req.run_name.clone());
            match self.store.update_binding(&binding) {
                Ok(_) => {
                    debug!(cluster = %req.cluster, binding = %binding.name, "binding bound");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < self.max_attempts => continue,
                Err(e) => return Err(e).context("binding cluster"),
            }
        }
    }
}

impl ClusterUpdater for BindingUpdater {
    fn update_cluster(&self, request: ClusterUpdateRequest) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { self.bind(&request) })
    }
}

/// Result of one dispatched update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub cluster: String,
    pub result: Result<(), String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageExecution {
    /// Sorted by cluster name.
    pub outcomes: Vec<TaskOutcome>,
    /// Requests the stop check held back.
    pub not_dispatched: Vec<String>,
}

/// Run `requests` with at most `max_concurrency` in flight.
pub async fn execute_stage(
    updater: Arc<dyn ClusterUpdater>,
    requests: Vec<ClusterUpdateRequest>,
    max_concurrency: usize,
    stop: &(dyn Fn() -> bool + Sync),
) -> StageExecution {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut handles = Vec::with_capacity(requests.len());
    let mut exec = StageExecution::default();

    let mut pending = requests.into_iter();
    while let Some(req) = pending.next() {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                exec.not_dispatched.push(req.cluster);
                break;
            }
        };
        if stop() {
            debug!(stage = %req.stage, "stop requested, holding back remaining cluster updates");
            exec.not_dispatched.push(req.cluster);
            exec.not_dispatched.extend(pending.by_ref().map(|r| r.cluster));
            break;
        }
        let cluster = req.cluster.clone();
        let updater = Arc::clone(&updater);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            updater.update_cluster(req).await
        });
        handles.push((cluster, handle));
    }

    for (cluster, handle) in handles {
        let result = match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(e) => {
                warn!(%cluster, error = %e, "cluster update task ended abnormally");
                Err(format!("cluster update task ended abnormally: {e}"))
            }
        };
        exec.outcomes.push(TaskOutcome { cluster, result });
    }
    exec.outcomes.sort_by(|a, b| a.cluster.cmp(&b.cluster));
    exec
}
