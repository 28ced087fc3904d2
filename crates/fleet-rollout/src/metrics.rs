//! Update-run metric emission and cleanup.
//!
//! Every series is keyed by the run's namespace and name so a deleted run
//! can drop all of its series with one partial match per family.

use fleet_metrics::HubMetrics;
use fleet_state::{
    StageStatus, StageTaskStatus, TASK_APPROVAL_REQUEST_APPROVED_CONDITION,
    TASK_APPROVAL_REQUEST_CREATED_CONDITION, UpdateRun, find_condition, is_condition_true,
};
use tracing::debug;

/// `taskType` label for cluster-update approvals.
pub const TASK_TYPE_CLUSTER_UPDATE: &str = "clusterUpdate";

/// Stamp the run's reported condition with the current time. Runs without a
/// condition at the current generation emit nothing.
pub fn emit_update_run_status_metric(metrics: &HubMetrics, run: &UpdateRun) {
    let Some(cond) = run.reported_condition() else {
        debug!(update_run = %run.key(), "no current condition on update run, status metric not emitted");
        return;
    };
    metrics.update_run_status_last_timestamp.set(
        &[
            run.namespace.as_deref().unwrap_or(""),
            &run.name,
            run.spec.state.as_str(),
            &cond.type_,
            cond.status.as_str(),
            &cond.reason,
        ],
        fleet_metrics::epoch_secs() as f64,
    );
}

/// Observe approved − created for a task. Both conditions must be true at
/// the run's generation. Returns whether a sample was recorded.
pub fn record_approval_request_latency(
    metrics: &HubMetrics,
    task: &StageTaskStatus,
    run: &UpdateRun,
    task_type: &str,
) -> bool {
    let created = find_condition(&task.conditions, TASK_APPROVAL_REQUEST_CREATED_CONDITION);
    let approved = find_condition(&task.conditions, TASK_APPROVAL_REQUEST_APPROVED_CONDITION);
    if !is_condition_true(created, run.generation) || !is_condition_true(approved, run.generation) {
        return false;
    }
    let (Some(created), Some(approved)) = (created, approved) else {
        return false;
    };
    let latency = approved
        .last_transition_time
        .saturating_sub(created.last_transition_time);
    metrics.update_run_approval_request_latency.observe(
        &[run.namespace.as_deref().unwrap_or(""), &run.name, task_type],
        latency as f64,
    );
    true
}

/// Observe now − stage start. Stages that never started record nothing.
pub fn record_stage_cluster_updating_duration(
    metrics: &HubMetrics,
    stage: &StageStatus,
    run: &UpdateRun,
    now: u64,
) -> bool {
    let Some(start) = stage.start_time else {
        return false;
    };
    metrics.update_run_stage_cluster_updating_duration.observe(
        &[run.namespace.as_deref().unwrap_or(""), &run.name],
        now.saturating_sub(start) as f64,
    );
    true
}

/// Drop every series of a run. Returns the number of series removed.
pub fn delete_update_run_metrics(metrics: &HubMetrics, namespace: Option<&str>, name: &str) -> usize {
    let filter = [("namespace", namespace.unwrap_or("")), ("name", name)];
    let removed = metrics.update_run_status_last_timestamp.delete_partial_match(&filter)
        + metrics
            .update_run_stage_cluster_updating_duration
            .delete_partial_match(&filter)
        + metrics.update_run_approval_request_latency.delete_partial_match(&filter);
    debug!(namespace = ?namespace, name, removed, "update run metrics deleted");
    removed
}
