//! Update-run controller — drives a run through its stages.
//!
//! A reconcile picks up wherever the stored status left off:
//!
//! 1. An unplanned run gets its stage plan and becomes `Initialized`.
//! 2. With spec state `Run` it becomes `Progressing` and works through the
//!    stages in declared order. A stage starts only after every task of the
//!    previous stage is terminal.
//! 3. Gated tasks wait in `ApprovalRequestCreated` until [`UpdateRunController::approve_task`].
//! 4. Ready tasks move to `Updating` and the status is saved before any
//!    update is dispatched, so a restart re-dispatches instead of losing work.
//!
//! Spec state `Stop` halts new dispatch; `Run` resumes it.

use std::sync::Arc;

use fleet_core::RolloutConfig;
use fleet_metrics::{HubMetrics, epoch_secs};
use fleet_state::{
    BindingState, Condition, ConditionStatus, ObjectKey, REASON_STARTED, REASON_STOPPED,
    RUN_PROGRESSING_CONDITION, RunPhase, RunRequestState, StagePhase, StateStore, TaskPhase,
    UpdateRun, set_condition,
};
use fleet_workqueue::{BoxFuture, Reconciler, Requeue};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::executor::{ClusterUpdateRequest, ClusterUpdater, execute_stage};
use crate::metrics::{
    TASK_TYPE_CLUSTER_UPDATE, delete_update_run_metrics, emit_update_run_status_metric,
    record_approval_request_latency, record_stage_cluster_updating_duration,
};
use crate::plan::compute_stage_plan;
use crate::policy::{AbortOnFailure, FailureAction, FailurePolicy};

const MAX_WRITE_ATTEMPTS: u32 = 3;

/// What preparing the current stage produced.
#[derive(Debug, Default)]
struct StagePrep {
    stage: String,
    /// Most tasks of the stage allowed in `Updating` at once.
    limit: usize,
    /// Clusters in `Updating`, to be dispatched.
    dispatch: Vec<String>,
    /// Clusters that just left `ApprovalRequestApproved`.
    newly_approved: Vec<String>,
    /// The stage finished without dispatching anything.
    completed: bool,
}

/// Reconciles staged update runs.
pub struct UpdateRunController {
    store: StateStore,
    updater: Arc<dyn ClusterUpdater>,
    failure_policy: Arc<dyn FailurePolicy>,
    metrics: Arc<HubMetrics>,
    default_max_concurrency: usize,
    shutdown: Option<watch::Receiver<bool>>,
}

impl UpdateRunController {
    pub fn new(
        store: StateStore,
        updater: Arc<dyn ClusterUpdater>,
        metrics: Arc<HubMetrics>,
        config: &RolloutConfig,
    ) -> Self {
        Self {
            store,
            updater,
            failure_policy: Arc::new(AbortOnFailure),
            metrics,
            default_max_concurrency: config.default_stage_max_concurrency.max(1),
            shutdown: None,
        }
    }

    pub fn with_failure_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Hold back new dispatch once `rx` flips to true.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    // ── Operator actions ───────────────────────────────────────────

    /// Approve the gated task of `cluster` in `stage`. Approving an already
    /// approved task is a no-op.
    pub fn approve_task(&self, key: &ObjectKey, stage: &str, cluster: &str) -> RolloutResult<()> {
        let now = epoch_secs();
        self.modify_run(key, |run| {
            let generation = run.generation;
            let task = run
                .status
                .stages
                .iter_mut()
                .find(|s| s.name == stage)
                .and_then(|s| s.task_mut(cluster))
                .ok_or_else(|| RolloutError::TaskNotFound {
                    stage: stage.to_string(),
                    cluster: cluster.to_string(),
                })?;
            match task.phase {
                TaskPhase::ApprovalRequestCreated => {
                    task.transition(TaskPhase::ApprovalRequestApproved, "approved", generation, now)?;
                    Ok(())
                }
                TaskPhase::ApprovalRequestApproved => Ok(()),
                phase => Err(RolloutError::NotAwaitingApproval {
                    cluster: cluster.to_string(),
                    phase,
                }),
            }
        })?;
        info!(update_run = %key, stage, cluster, "cluster update approved");
        Ok(())
    }

    /// Mark a run for deletion; the next reconcile releases its metrics and
    /// removes it. Returns false if the run does not exist.
    pub fn request_update_run_deletion(&self, key: &ObjectKey) -> RolloutResult<bool> {
        let found = self.store.request_update_run_deletion(key, epoch_secs())?;
        if found {
            debug!(update_run = %key, "update run deletion requested");
        }
        Ok(found)
    }

    // ── Reconcile ──────────────────────────────────────────────────

    pub async fn reconcile(&self, key: &ObjectKey) -> RolloutResult<Requeue> {
        let Some(run) = self.store.get_update_run(key)? else {
            delete_update_run_metrics(&self.metrics, key.namespace.as_deref(), &key.name);
            return Ok(Requeue::Done);
        };
        if run.is_deleting() {
            delete_update_run_metrics(&self.metrics, run.namespace.as_deref(), &run.name);
            self.store.delete_update_run(&run)?;
            info!(update_run = %key, "update run deleted");
            return Ok(Requeue::Done);
        }

        let run = match run.status.phase {
            None => self.initialize(run)?,
            Some(_) => run,
        };

        match run.status.phase {
            Some(phase) if phase.is_terminal() => {
                emit_update_run_status_metric(&self.metrics, &run);
                Ok(Requeue::Done)
            }
            Some(RunPhase::Initialized) => {
                if run.spec.state != RunRequestState::Run {
                    emit_update_run_status_metric(&self.metrics, &run);
                    return Ok(Requeue::Done);
                }
                let (run, ()) = self.modify_run(key, |r| {
                    if r.status.phase == Some(RunPhase::Initialized) {
                        r.transition(RunPhase::Progressing, "update run started", epoch_secs())?;
                    }
                    Ok(())
                })?;
                info!(update_run = %key, stages = run.status.stages.len(), "update run progressing");
                self.progress(key).await
            }
            _ => self.progress(key).await,
        }
    }

    /// Compute the stage plan. Planning problems fail the run for good.
    fn initialize(&self, run: UpdateRun) -> RolloutResult<UpdateRun> {
        let key = run.key();
        let placement = ObjectKey {
            namespace: run.namespace.clone(),
            name: run.spec.placement_name.clone(),
        };
        let snapshot = self.store.latest_policy_snapshot(&placement)?;
        let bindings = self.store.list_bindings_for_placement(&placement)?;
        let clusters = self.store.list_member_clusters()?;
        let now = epoch_secs();

        let planned = compute_stage_plan(&run.spec.stages, &bindings, &clusters);
        let (run, ()) = self.modify_run(&key, |r| {
            if r.status.phase.is_some() {
                return Ok(());
            }
            match &planned {
                Ok(stages) => {
                    r.status.stages = stages.clone();
                    r.status.policy_snapshot_name = snapshot.as_ref().map(|s| s.name.clone());
                    let tasks: usize = stages.iter().map(|s| s.tasks.len()).sum();
                    r.transition(
                        RunPhase::Initialized,
                        &format!("planned {} stage(s) with {tasks} cluster update(s)", stages.len()),
                        now,
                    )?;
                }
                Err(e) => {
                    r.transition(RunPhase::Failed, &e.to_string(), now)?;
                }
            }
            Ok(())
        })?;

        match &planned {
            Ok(_) => info!(update_run = %key, placement = %placement, "update run initialized"),
            Err(e) => warn!(update_run = %key, placement = %placement, error = %e, "update run initialization failed"),
        }
        emit_update_run_status_metric(&self.metrics, &run);
        Ok(run)
    }

    /// Work through the stages until the run finishes, waits for an
    /// approval, or is stopped.
    async fn progress(&self, key: &ObjectKey) -> RolloutResult<Requeue> {
        loop {
            if self.is_shutting_down() {
                debug!(update_run = %key, "shutting down, leaving update run as is");
                return Ok(Requeue::Done);
            }
            let now = epoch_secs();

            // Stop / resume bookkeeping on the Progressing condition.
            let (run, stopped) = self.modify_run(key, |r| {
                let stopped = r.spec.state == RunRequestState::Stop;
                let cond = if stopped {
                    Condition::new(
                        RUN_PROGRESSING_CONDITION,
                        ConditionStatus::False,
                        REASON_STOPPED,
                        "update run stopped on request",
                        r.generation,
                        now,
                    )
                } else {
                    Condition::new(
                        RUN_PROGRESSING_CONDITION,
                        ConditionStatus::True,
                        REASON_STARTED,
                        "update run started",
                        r.generation,
                        now,
                    )
                };
                set_condition(&mut r.status.conditions, cond);
                Ok(stopped)
            })?;
            if stopped {
                emit_update_run_status_metric(&self.metrics, &run);
                info!(update_run = %key, "update run stopped");
                return Ok(Requeue::Done);
            }
            if run.status.phase != Some(RunPhase::Progressing) {
                emit_update_run_status_metric(&self.metrics, &run);
                return Ok(Requeue::Done);
            }
            if run.is_deleting() {
                // The delete event brings the run back for cleanup.
                debug!(update_run = %key, "update run is being deleted, not starting more work");
                return Ok(Requeue::Done);
            }

            let Some(idx) = run.status.stages.iter().position(|s| !s.phase.is_terminal()) else {
                let (run, ()) = self.modify_run(key, |r| {
                    if r.status.phase == Some(RunPhase::Progressing) {
                        r.transition(RunPhase::Succeeded, "all stages completed", now)?;
                    }
                    Ok(())
                })?;
                emit_update_run_status_metric(&self.metrics, &run);
                info!(update_run = %key, "update run succeeded");
                return Ok(Requeue::Done);
            };

            let default_limit = self.default_max_concurrency;
            let (run, prep) = self.modify_run(key, |r| prepare_stage(r, idx, default_limit, now))?;
            for cluster in &prep.newly_approved {
                if let Some(task) = run.status.stages[idx]
                    .tasks
                    .iter()
                    .find(|t| &t.cluster_name == cluster)
                {
                    record_approval_request_latency(&self.metrics, task, &run, TASK_TYPE_CLUSTER_UPDATE);
                }
            }
            if prep.completed {
                record_stage_cluster_updating_duration(&self.metrics, &run.status.stages[idx], &run, now);
                info!(update_run = %key, stage = %prep.stage, "stage completed");
                emit_update_run_status_metric(&self.metrics, &run);
                continue;
            }
            if prep.dispatch.is_empty() {
                debug!(update_run = %key, stage = %prep.stage, "waiting for approvals");
                emit_update_run_status_metric(&self.metrics, &run);
                return Ok(Requeue::Done);
            }

            let requests: Vec<ClusterUpdateRequest> = prep
                .dispatch
                .iter()
                .map(|cluster| ClusterUpdateRequest {
                    namespace: run.namespace.clone(),
                    run_name: run.name.clone(),
                    placement_name: run.spec.placement_name.clone(),
                    stage: prep.stage.clone(),
                    cluster: cluster.clone(),
                })
                .collect();
            let limit = prep.limit;
            debug!(update_run = %key, stage = %prep.stage, clusters = requests.len(), limit, "dispatching cluster updates");

            let stop = || self.should_stop(key);
            let exec = execute_stage(Arc::clone(&self.updater), requests, limit, &stop).await;

            let now = epoch_secs();
            let policy = Arc::clone(&self.failure_policy);
            let (run, finished) = self.modify_run(key, |r| {
                apply_outcomes(r, idx, &exec.outcomes, policy.as_ref(), now)
            })?;
            let stage = &run.status.stages[idx];
            for o in &exec.outcomes {
                match &o.result {
                    Ok(()) => debug!(update_run = %key, stage = %stage.name, cluster = %o.cluster, "cluster updated"),
                    Err(e) => warn!(update_run = %key, stage = %stage.name, cluster = %o.cluster, error = %e, "cluster update failed"),
                }
            }
            match finished {
                Some(StagePhase::Succeeded) => {
                    record_stage_cluster_updating_duration(&self.metrics, stage, &run, now);
                    info!(update_run = %key, stage = %stage.name, "stage completed");
                }
                Some(StagePhase::Failed) => {
                    emit_update_run_status_metric(&self.metrics, &run);
                    warn!(update_run = %key, stage = %stage.name, "update run failed");
                    return Ok(Requeue::Done);
                }
                _ => {}
            }
            emit_update_run_status_metric(&self.metrics, &run);
            if !exec.not_dispatched.is_empty() {
                // Held-back tasks stay Updating; the stop or delete event
                // brings the run back.
                debug!(update_run = %key, held_back = exec.not_dispatched.len(), "dispatch halted");
                return Ok(Requeue::Done);
            }
        }
    }

    /// True once the run is gone, deleting, stopped, or the daemon is
    /// shutting down.
    fn should_stop(&self, key: &ObjectKey) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        match self.store.get_update_run(key) {
            Ok(Some(run)) => run.is_deleting() || run.spec.state == RunRequestState::Stop,
            Ok(None) => true,
            Err(e) => {
                warn!(update_run = %key, error = %e, "cannot read update run, holding back dispatch");
                true
            }
        }
    }

    /// Read-modify-write with optimistic concurrency. `f` runs against a
    /// fresh copy on every attempt; unchanged runs are not written.
    fn modify_run<T>(
        &self,
        key: &ObjectKey,
        mut f: impl FnMut(&mut UpdateRun) -> RolloutResult<T>,
    ) -> RolloutResult<(UpdateRun, T)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self
                .store
                .get_update_run(key)?
                .ok_or_else(|| RolloutError::RunNotFound(key.to_string()))?;
            let mut next = current.clone();
            let out = f(&mut next)?;
            if next == current {
                return Ok((current, out));
            }
            match self.store.update_update_run(&next) {
                Ok(saved) => return Ok((saved, out)),
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(update_run = %key, attempt, "update run changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Start the stage if needed, open approval gates and move ready tasks to
/// `Updating`. At most the stage's concurrency limit is `Updating` at once;
/// the rest wait for a later pass.
fn prepare_stage(
    run: &mut UpdateRun,
    idx: usize,
    default_limit: usize,
    now: u64,
) -> RolloutResult<StagePrep> {
    let generation = run.generation;
    let Some(def) = run.status.stages.get(idx).map(|s| s.name.clone()) else {
        return Ok(StagePrep::default());
    };
    let max_concurrency = run
        .spec
        .stages
        .iter()
        .find(|s| s.name == def)
        .and_then(|s| s.max_concurrency);
    let limit = max_concurrency.unwrap_or(default_limit).max(1);
    let stage = &mut run.status.stages[idx];
    let mut prep = StagePrep {
        stage: stage.name.clone(),
        limit,
        ..Default::default()
    };

    if stage.phase == StagePhase::Pending {
        stage.transition(StagePhase::Progressing, generation, now)?;
    }
    let mut updating = stage
        .tasks
        .iter()
        .filter(|t| t.phase == TaskPhase::Updating)
        .count();
    for task in &mut stage.tasks {
        if task.phase == TaskPhase::Pending && task.requires_approval {
            task.transition(TaskPhase::ApprovalRequestCreated, "waiting for approval", generation, now)?;
        }
        if task.is_ready() && updating < limit {
            updating += 1;
            if task.phase == TaskPhase::ApprovalRequestApproved {
                prep.newly_approved.push(task.cluster_name.clone());
            }
            task.transition(TaskPhase::Updating, "cluster update dispatched", generation, now)?;
        }
        if task.phase == TaskPhase::Updating {
            prep.dispatch.push(task.cluster_name.clone());
        }
    }
    if stage.all_tasks_terminal() {
        stage.transition(StagePhase::Succeeded, generation, now)?;
        prep.completed = true;
    }
    Ok(prep)
}

/// Record dispatch results. Returns the stage's terminal phase if it just
/// finished.
fn apply_outcomes(
    run: &mut UpdateRun,
    idx: usize,
    outcomes: &[crate::executor::TaskOutcome],
    policy: &dyn FailurePolicy,
    now: u64,
) -> RolloutResult<Option<StagePhase>> {
    let generation = run.generation;
    let Some(stage_name) = run.status.stages.get(idx).map(|s| s.name.clone()) else {
        return Ok(None);
    };

    let mut abort: Option<String> = None;
    let mut tolerated = Vec::new();
    for o in outcomes {
        if let Err(e) = &o.result {
            match policy.on_task_failure(run, &stage_name, &o.cluster, e) {
                FailureAction::Continue => tolerated.push(o.cluster.clone()),
                FailureAction::AbortRun => {
                    abort.get_or_insert_with(|| format!("cluster {} failed to update: {e}", o.cluster));
                }
            }
        }
    }

    let stage = &mut run.status.stages[idx];
    for o in outcomes {
        let Some(task) = stage.task_mut(&o.cluster) else {
            continue;
        };
        if task.phase != TaskPhase::Updating {
            continue;
        }
        match &o.result {
            Ok(()) => task.transition(TaskPhase::Succeeded, "cluster updated", generation, now)?,
            Err(e) => {
                task.transition(TaskPhase::Failed, e, generation, now)?;
                task.failure_tolerated = tolerated.contains(&o.cluster);
            }
        }
    }

    if let Some(message) = abort {
        for task in &mut stage.tasks {
            match task.phase {
                TaskPhase::Pending | TaskPhase::ApprovalRequestCreated | TaskPhase::ApprovalRequestApproved => {
                    task.transition(TaskPhase::Skipped, "update run aborted", generation, now)?;
                }
                TaskPhase::Updating => {
                    task.transition(TaskPhase::Failed, "update run aborted", generation, now)?;
                }
                _ => {}
            }
        }
        stage.transition(StagePhase::Failed, generation, now)?;
        run.transition(RunPhase::Failed, &message, now)?;
        return Ok(Some(StagePhase::Failed));
    }

    if stage.all_tasks_terminal() {
        stage.transition(StagePhase::Succeeded, generation, now)?;
        return Ok(Some(StagePhase::Succeeded));
    }
    Ok(None)
}

impl Reconciler<ObjectKey> for UpdateRunController {
    fn reconcile(&self, key: ObjectKey) -> BoxFuture<'_, anyhow::Result<Requeue>> {
        Box::pin(async move { Ok(UpdateRunController::reconcile(self, &key).await?) })
    }
}

/// Bindings a run would target right now; handy for callers that want to
/// preview a plan.
pub fn targeted_clusters(store: &StateStore, run: &UpdateRun) -> RolloutResult<Vec<String>> {
    let placement = ObjectKey {
        namespace: run.namespace.clone(),
        name: run.spec.placement_name.clone(),
    };
    Ok(store
        .list_bindings_for_placement(&placement)?
        .into_iter()
        .filter(|b| b.state != BindingState::Unscheduled)
        .map(|b| b.target_cluster)
        .collect())
}
