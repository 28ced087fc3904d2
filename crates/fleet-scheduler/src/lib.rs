//! fleet-scheduler — places workloads onto member clusters.
//!
//! A scheduling cycle runs the latest policy snapshot of a placement through
//! a profile of plugins:
//!
//! 1. **Eligibility** drops leaving and unhealthy clusters.
//! 2. **PreFilter** runs once per plugin; `Skip` opts the plugin out of the
//!    rest of the cycle.
//! 3. **Filter** runs per cluster; the first rejection wins.
//! 4. **Score** sums plugin scores for the feasible clusters.
//!
//! The [`Scheduler`] then selects clusters per the placement type and the
//! [`BindingReconciler`] materializes them as bindings.

pub mod bindings;
pub mod eligibility;
pub mod error;
pub mod framework;
pub mod metrics;
pub mod plugins;
pub mod scheduler;

pub use bindings::{BindingAction, BindingChanges, BindingReconciler, plan_bindings, plan_for_cluster};
pub use eligibility::ClusterEligibilityChecker;
pub use error::{FrameworkError, FrameworkResult, SchedulerError, SchedulerResult};
pub use framework::{
    CycleContext, CycleState, Evaluation, FilterPlugin, Framework, Plugin, PreFilterPlugin,
    Profile, ProfileBuilder, ScorePlugin, ScoredCluster, Status, StatusCode,
};
pub use metrics::{delete_placement_status_metrics, emit_placement_status_metric};
pub use plugins::{ClusterAffinity, NamespaceAffinity};
pub use scheduler::{Scheduler, Selection, select_clusters, validate_policy};
