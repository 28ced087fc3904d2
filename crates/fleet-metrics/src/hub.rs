//! Hub metric families and the process-wide registry.
//!
//! Components take an `Arc<HubMetrics>`; the daemon passes
//! [`HubMetrics::global`], tests pass a fresh [`HubMetrics::new`].

use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::vec::{GaugeVec, HistogramVec};

pub const PLACEMENT_STATUS_LAST_TIMESTAMP: &str =
    "fleet_workload_placement_status_last_timestamp_seconds";
pub const EVICTION_COMPLETE: &str = "fleet_workload_eviction_complete";
pub const UPDATE_RUN_STATUS_LAST_TIMESTAMP: &str =
    "fleet_workload_update_run_status_last_timestamp_seconds";
pub const UPDATE_RUN_APPROVAL_REQUEST_LATENCY: &str =
    "fleet_workload_update_run_approval_request_latency_seconds";
pub const UPDATE_RUN_STAGE_CLUSTER_UPDATING_DURATION: &str =
    "fleet_workload_update_run_stage_cluster_updating_duration_seconds";
pub const SCHEDULING_CYCLE_DURATION: &str = "scheduling_cycle_duration_milliseconds";
pub const SCHEDULING_ACTIVE_WORKERS: &str = "scheduling_active_workers";

const APPROVAL_LATENCY_BUCKETS: &[f64] = &[
    60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 21600.0, 43200.0, 86400.0,
];
const STAGE_DURATION_BUCKETS: &[f64] = &[15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0];
const CYCLE_DURATION_BUCKETS: &[f64] = &[
    10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0,
];

static GLOBAL: OnceLock<Arc<HubMetrics>> = OnceLock::new();

/// Current Unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Every metric family the hub exports.
pub struct HubMetrics {
    pub placement_status_last_timestamp: GaugeVec,
    pub eviction_complete: GaugeVec,
    pub update_run_status_last_timestamp: GaugeVec,
    pub update_run_approval_request_latency: HistogramVec,
    pub update_run_stage_cluster_updating_duration: HistogramVec,
    pub scheduling_cycle_duration: HistogramVec,
    pub scheduling_active_workers: GaugeVec,
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            placement_status_last_timestamp: GaugeVec::new(
                PLACEMENT_STATUS_LAST_TIMESTAMP,
                "Last update timestamp of placement status in seconds",
                &["namespace", "name", "generation", "conditionType", "status", "reason"],
            ),
            eviction_complete: GaugeVec::new(
                EVICTION_COMPLETE,
                "Eviction complete status",
                &["name", "isCompleted", "isValid"],
            ),
            update_run_status_last_timestamp: GaugeVec::new(
                UPDATE_RUN_STATUS_LAST_TIMESTAMP,
                "Last update timestamp of update run status in seconds",
                &["namespace", "name", "state", "condition", "status", "reason"],
            ),
            update_run_approval_request_latency: HistogramVec::new(
                UPDATE_RUN_APPROVAL_REQUEST_LATENCY,
                "Time from an approval request being created to it being approved, in seconds",
                &["namespace", "name", "taskType"],
                APPROVAL_LATENCY_BUCKETS,
            ),
            update_run_stage_cluster_updating_duration: HistogramVec::new(
                UPDATE_RUN_STAGE_CLUSTER_UPDATING_DURATION,
                "Time a stage spent updating its clusters, in seconds",
                &["namespace", "name"],
                STAGE_DURATION_BUCKETS,
            ),
            scheduling_cycle_duration: HistogramVec::new(
                SCHEDULING_CYCLE_DURATION,
                "The duration of a scheduling cycle run in milliseconds",
                &["is_failed", "needs_requeue"],
                CYCLE_DURATION_BUCKETS,
            ),
            scheduling_active_workers: GaugeVec::new(
                SCHEDULING_ACTIVE_WORKERS,
                "Number of currently running scheduling loops",
                &[],
            ),
        }
    }

    /// Install `metrics` as the process-wide registry. Returns false if a
    /// registry was already installed (the existing one is kept).
    pub fn init_global(metrics: Arc<HubMetrics>) -> bool {
        let installed = GLOBAL.set(metrics).is_ok();
        debug!(installed, "global hub metrics registry");
        installed
    }

    /// The process-wide registry, created with defaults on first use.
    pub fn global() -> Arc<HubMetrics> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(HubMetrics::new())))
    }

    /// Record one eviction's outcome. The opposite completion series for the
    /// same eviction is removed so only the latest state is exported.
    pub fn emit_eviction_status(&self, name: &str, is_completed: bool, is_valid: bool) {
        let completed = bool_label(is_completed);
        let valid = bool_label(is_valid);
        self.eviction_complete
            .delete_partial_match(&[("name", name), ("isCompleted", bool_label(!is_completed))]);
        self.eviction_complete.set(&[name, completed, valid], 1.0);
    }

    /// Drop all series belonging to an eviction.
    pub fn delete_eviction_status(&self, name: &str) -> usize {
        self.eviction_complete.delete_partial_match(&[("name", name)])
    }
}

/// Lower-case boolean label value.
pub fn bool_label(v: bool) -> &'static str {
    if v { "true" } else { "false" }
}
