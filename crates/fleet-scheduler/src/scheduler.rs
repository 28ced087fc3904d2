//! Scheduling cycle orchestrator.
//!
//! One cycle takes the latest policy snapshot of a placement and the member
//! cluster inventory through eligibility, the plugin pipeline and cluster
//! selection, then hands the selected clusters to the binding reconciler and
//! records the outcome on the snapshot and the placement.
//!
//! A cycle is idempotent: running it again with unchanged inputs performs no
//! writes.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_metrics::{HubMetrics, epoch_secs};
use fleet_state::{
    BindingState, ClusterDecision, Condition, ConditionStatus, ObjectKey, Placement,
    PlacementPolicy, PlacementType, PolicySnapshot, PolicySnapshotStatus, SCHEDULED_CONDITION,
    SCHEDULER_CLEANUP_FINALIZER, StateStore, set_condition,
};
use fleet_workqueue::{BoxFuture, Reconciler, Requeue};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bindings::BindingReconciler;
use crate::eligibility::ClusterEligibilityChecker;
use crate::error::{FrameworkError, SchedulerResult};
use crate::framework::{CycleContext, CycleState, Evaluation, Framework, ScoredCluster};
use crate::metrics::{
    ActiveWorkerGuard, delete_placement_status_metrics, emit_placement_status_metric,
    observe_cycle,
};

pub const REASON_POLICY_FULFILLED: &str = "SchedulingPolicyFulfilled";
pub const REASON_POLICY_UNFULFILLED: &str = "SchedulingPolicyUnfulfilled";
pub const REASON_INVALID_POLICY: &str = "InvalidPolicy";
pub const REASON_SCHEDULING_FAILED: &str = "SchedulingFailed";

pub const REASON_PICKED: &str = "picked by scheduling policy";
pub const REASON_NOT_IN_FIXED_LIST: &str = "cluster is not in the list of fixed clusters";
pub const REASON_NOT_IN_TOP_N: &str = "cluster scored lower than the picked clusters";
pub const REASON_NOT_A_MEMBER: &str = "cluster is not a member of the fleet";

/// Most unselected decisions recorded on a snapshot.
pub const MAX_UNSELECTED_DECISIONS: usize = 20;

/// Max allowed magnitude of a preferred term weight.
pub const MAX_PREFERRED_WEIGHT: i32 = 100;

const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);
const UNFULFILLED_REQUEUE_DELAY: Duration = Duration::from_secs(30);

// ── Policy validation ─────────────────────────────────────────────

/// Reject policies the scheduler cannot act on. The error is the message
/// recorded on the snapshot's condition.
pub fn validate_policy(policy: &PlacementPolicy) -> Result<(), String> {
    if let PlacementType::PickFixed { cluster_names } = &policy.placement_type {
        if cluster_names.is_empty() {
            return Err("a PickFixed policy must name at least one cluster".to_string());
        }
        let mut seen = HashSet::new();
        for name in cluster_names {
            if name.is_empty() {
                return Err("cluster names must not be empty".to_string());
            }
            if !seen.insert(name.as_str()) {
                return Err(format!("cluster {name} is listed more than once"));
            }
        }
    }
    if let Some(affinity) = &policy.affinity {
        if let Some(term) = affinity
            .preferred
            .iter()
            .find(|t| t.weight.abs() > MAX_PREFERRED_WEIGHT)
        {
            return Err(format!(
                "preferred term weight {} is outside [-{MAX_PREFERRED_WEIGHT}, {MAX_PREFERRED_WEIGHT}]",
                term.weight
            ));
        }
    }
    Ok(())
}

// ── Selection ─────────────────────────────────────────────────────

/// Clusters picked by a policy, and why the others were not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub selected: Vec<ClusterDecision>,
    /// Sorted by cluster name.
    pub unselected: Vec<ClusterDecision>,
    /// Number of clusters the policy asks for; `None` for PickAll.
    pub wanted: Option<usize>,
}

impl Selection {
    pub fn is_fulfilled(&self) -> bool {
        self.wanted.is_none_or(|n| self.selected.len() >= n)
    }
}

fn unselected(cluster_name: &str, reason: impl Into<String>) -> ClusterDecision {
    ClusterDecision {
        cluster_name: cluster_name.to_string(),
        selected: false,
        score: None,
        reason: reason.into(),
    }
}

/// Apply the placement type to a finished evaluation.
///
/// `ineligible` are the clusters eligibility already excluded. PickN ranks by
/// total score, highest first, and breaks ties by cluster name.
pub fn select_clusters(
    placement_type: &PlacementType,
    eval: &Evaluation,
    ineligible: Vec<ClusterDecision>,
) -> Selection {
    let mut out = Selection {
        unselected: ineligible,
        ..Default::default()
    };
    for (cluster, status) in &eval.rejected {
        out.unselected.push(unselected(cluster, status.message()));
    }

    let picked = |c: &ScoredCluster| ClusterDecision {
        cluster_name: c.cluster_name.clone(),
        selected: true,
        score: Some(c.score),
        reason: REASON_PICKED.to_string(),
    };

    match placement_type {
        PlacementType::PickAll => {
            out.selected = eval.feasible.iter().map(picked).collect();
        }
        PlacementType::PickFixed { cluster_names } => {
            let wanted: BTreeSet<&str> = cluster_names.iter().map(String::as_str).collect();
            for c in &eval.feasible {
                if wanted.contains(c.cluster_name.as_str()) {
                    out.selected.push(picked(c));
                } else {
                    out.unselected.push(unselected(&c.cluster_name, REASON_NOT_IN_FIXED_LIST));
                }
            }
            for name in &wanted {
                let known = out.selected.iter().any(|d| d.cluster_name == *name)
                    || out.unselected.iter().any(|d| d.cluster_name == *name);
                if !known {
                    out.unselected.push(unselected(name, REASON_NOT_A_MEMBER));
                }
            }
            out.wanted = Some(wanted.len());
        }
        PlacementType::PickN { number_of_clusters } => {
            let n = *number_of_clusters as usize;
            let mut ranked: Vec<_> = eval.feasible.iter().collect();
            ranked.sort_by(|a, b| {
                b.score
                    .total()
                    .cmp(&a.score.total())
                    .then_with(|| a.cluster_name.cmp(&b.cluster_name))
            });
            for (i, c) in ranked.into_iter().enumerate() {
                if i < n {
                    out.selected.push(picked(c));
                } else {
                    let mut d = unselected(&c.cluster_name, REASON_NOT_IN_TOP_N);
                    d.score = Some(c.score);
                    out.unselected.push(d);
                }
            }
            out.wanted = Some(n);
        }
    }

    out.selected.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
    out.unselected.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
    out
}

// ── Scheduler ─────────────────────────────────────────────────────

/// Runs scheduling cycles for placements.
pub struct Scheduler {
    store: StateStore,
    framework: Framework,
    eligibility: ClusterEligibilityChecker,
    bindings: BindingReconciler,
    metrics: Arc<HubMetrics>,
    cycle_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        framework: Framework,
        eligibility: ClusterEligibilityChecker,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            bindings: BindingReconciler::new(store.clone()),
            store,
            framework,
            eligibility,
            metrics,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            shutdown: None,
        }
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    /// Cancel in-flight cycles when `rx` flips to true.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one scheduling cycle for the placement at `key`.
    pub fn schedule_once(&self, key: &ObjectKey) -> SchedulerResult<Requeue> {
        let _active = ActiveWorkerGuard::new(&self.metrics);
        let started = Instant::now();
        let mut ctx = CycleContext::with_timeout(self.cycle_timeout);
        if let Some(rx) = &self.shutdown {
            ctx = ctx.with_cancellation(rx.clone());
        }

        debug!(placement = %key, "scheduling cycle started");
        let result = self.run_cycle(&ctx, key);
        let (failed, requeue) = match &result {
            Ok(Requeue::Done) => (false, false),
            Ok(Requeue::After(_)) => (false, true),
            Err(_) => (true, true),
        };
        observe_cycle(&self.metrics, started.elapsed(), failed, requeue);
        debug!(
            placement = %key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            failed,
            requeue,
            "scheduling cycle finished"
        );
        result
    }

    fn run_cycle(&self, ctx: &CycleContext, key: &ObjectKey) -> SchedulerResult<Requeue> {
        let Some(placement) = self.store.get_placement(key)? else {
            debug!(placement = %key, "placement not found, nothing to schedule");
            return Ok(Requeue::Done);
        };
        if placement.is_deleting() {
            return self.finalize_deletion(placement);
        }
        let Some(snapshot) = self.store.latest_policy_snapshot(key)? else {
            debug!(placement = %key, "placement has no policy snapshot yet");
            return Ok(Requeue::Done);
        };
        let now = epoch_secs();

        if let Err(message) = validate_policy(&snapshot.policy) {
            warn!(placement = %key, snapshot = %snapshot.name, %message, "invalid scheduling policy");
            let cond = Condition::new(
                SCHEDULED_CONDITION,
                ConditionStatus::False,
                REASON_INVALID_POLICY,
                message,
                snapshot.generation,
                now,
            );
            let decisions = snapshot.status.cluster_decisions.clone();
            self.write_snapshot_status(&snapshot, cond.clone(), decisions)?;
            self.write_placement_condition(placement, cond)?;
            return Ok(Requeue::Done);
        }

        // Inventory-level eligibility first, plugins only see the rest.
        let mut candidates = Vec::new();
        let mut ineligible = Vec::new();
        for cluster in self.store.list_member_clusters()? {
            match self.eligibility.check(&cluster, now) {
                (true, _) => candidates.push(cluster),
                (false, reason) => {
                    debug!(placement = %key, cluster = %cluster.name, reason, "cluster not eligible");
                    ineligible.push(unselected(&cluster.name, reason));
                }
            }
        }
        let scheduled_or_bound: HashSet<String> = self
            .store
            .list_bindings_for_placement(key)?
            .into_iter()
            .filter(|b| b.state != BindingState::Unscheduled)
            .map(|b| b.target_cluster)
            .collect();

        let mut state = CycleState::new(candidates, scheduled_or_bound);
        let eval = match self.framework.evaluate(ctx, &mut state, &snapshot) {
            Ok(eval) => eval,
            Err(err) => {
                warn!(placement = %key, snapshot = %snapshot.name, error = %err, "scheduling cycle aborted");
                if let FrameworkError::PluginFailed { .. } = err {
                    let cond = Condition::new(
                        SCHEDULED_CONDITION,
                        ConditionStatus::False,
                        REASON_SCHEDULING_FAILED,
                        err.to_string(),
                        snapshot.generation,
                        now,
                    );
                    let decisions = snapshot.status.cluster_decisions.clone();
                    if let Err(e) = self.write_snapshot_status(&snapshot, cond, decisions) {
                        warn!(placement = %key, error = %e, "failed to record scheduling failure");
                    }
                }
                return Err(err.into());
            }
        };

        let selection = select_clusters(&snapshot.policy.placement_type, &eval, ineligible);
        let placement = self.ensure_finalizer(placement)?;
        let changes = self
            .bindings
            .reconcile(&placement, &snapshot, &selection.selected)?;

        let fulfilled = selection.is_fulfilled();
        let cond = if fulfilled {
            Condition::new(
                SCHEDULED_CONDITION,
                ConditionStatus::True,
                REASON_POLICY_FULFILLED,
                format!(
                    "found all {} cluster(s) needed as specified by the scheduling policy",
                    selection.selected.len()
                ),
                snapshot.generation,
                now,
            )
        } else {
            Condition::new(
                SCHEDULED_CONDITION,
                ConditionStatus::False,
                REASON_POLICY_UNFULFILLED,
                format!(
                    "could not find all the clusters needed as specified by the scheduling policy: want {}, found {}",
                    selection.wanted.unwrap_or_default(),
                    selection.selected.len()
                ),
                snapshot.generation,
                now,
            )
        };

        let mut decisions = selection.selected.clone();
        decisions.extend(
            selection
                .unselected
                .iter()
                .take(MAX_UNSELECTED_DECISIONS)
                .cloned(),
        );
        self.write_snapshot_status(&snapshot, cond.clone(), decisions)?;
        self.write_placement_condition(placement, cond)?;

        if !changes.is_empty() {
            info!(
                placement = %key,
                snapshot = %snapshot.name,
                selected = selection.selected.len(),
                created = changes.created,
                updated = changes.updated,
                unscheduled = changes.unscheduled,
                deleted = changes.deleted,
                "placement scheduled"
            );
        }

        if fulfilled {
            Ok(Requeue::Done)
        } else {
            Ok(Requeue::After(UNFULFILLED_REQUEUE_DELAY))
        }
    }

    /// Delete every binding, then release the placement.
    fn finalize_deletion(&self, placement: Placement) -> SchedulerResult<Requeue> {
        let key = placement.key();
        let deleted = self.bindings.delete_all(&placement)?;
        if placement.has_finalizer(SCHEDULER_CLEANUP_FINALIZER) {
            let mut released = placement.clone();
            released
                .finalizers
                .retain(|f| f != SCHEDULER_CLEANUP_FINALIZER);
            self.store.update_placement(&released)?;
        }
        let series = delete_placement_status_metrics(&self.metrics, &placement);
        info!(placement = %key, bindings = deleted, series, "placement cleaned up");
        Ok(Requeue::Done)
    }

    /// The finalizer goes on before any binding is written.
    fn ensure_finalizer(&self, placement: Placement) -> SchedulerResult<Placement> {
        if placement.has_finalizer(SCHEDULER_CLEANUP_FINALIZER) {
            return Ok(placement);
        }
        let mut updated = placement;
        updated
            .finalizers
            .push(SCHEDULER_CLEANUP_FINALIZER.to_string());
        let updated = self.store.update_placement(&updated)?;
        debug!(placement = %updated.key(), "cleanup finalizer added");
        Ok(updated)
    }

    fn write_snapshot_status(
        &self,
        snapshot: &PolicySnapshot,
        cond: Condition,
        decisions: Vec<ClusterDecision>,
    ) -> SchedulerResult<()> {
        let mut status: PolicySnapshotStatus = snapshot.status.clone();
        let mut changed = set_condition(&mut status.conditions, cond);
        if status.cluster_decisions != decisions {
            status.cluster_decisions = decisions;
            changed = true;
        }
        if !changed {
            return Ok(());
        }
        let mut updated = snapshot.clone();
        updated.status = status;
        self.store.update_policy_snapshot(&updated)?;
        Ok(())
    }

    fn write_placement_condition(&self, placement: Placement, cond: Condition) -> SchedulerResult<()> {
        let mut updated = placement;
        let mut cond = cond;
        cond.observed_generation = updated.generation;
        if !set_condition(&mut updated.conditions, cond) {
            return Ok(());
        }
        let updated = self.store.update_placement(&updated)?;
        if let Some(current) = fleet_state::find_condition(&updated.conditions, SCHEDULED_CONDITION) {
            emit_placement_status_metric(&self.metrics, &updated, current);
        }
        Ok(())
    }
}

impl Reconciler<ObjectKey> for Scheduler {
    fn reconcile(&self, key: ObjectKey) -> BoxFuture<'_, anyhow::Result<Requeue>> {
        Box::pin(async move { Ok(self.schedule_once(&key)?) })
    }
}
