//! fleet-rollout — staged update runs across a placement's clusters.
//!
//! A run assigns every scheduled or bound cluster of its placement to one
//! operator-declared stage, then updates the stages one after another.
//! Within a stage, updates are dispatched with bounded concurrency and may
//! be gated on approval.

pub mod controller;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod plan;
pub mod policy;

pub use controller::{UpdateRunController, targeted_clusters};
pub use error::{RolloutError, RolloutResult};
pub use executor::{
    BindingUpdater, ClusterUpdateRequest, ClusterUpdater, StageExecution, TaskOutcome,
    execute_stage,
};
pub use metrics::{
    TASK_TYPE_CLUSTER_UPDATE, delete_update_run_metrics, emit_update_run_status_metric,
    record_approval_request_latency, record_stage_cluster_updating_duration,
};
pub use plan::{PlanError, compute_stage_plan};
pub use policy::{AbortOnFailure, ContinueOnFailure, FailureAction, FailurePolicy};
