//! Scheduler-side metric emission.

use std::time::Duration;

use fleet_metrics::{HubMetrics, bool_label};
use fleet_state::{Condition, Placement};

/// Export the placement's current condition as a timestamp series. Earlier
/// series for the same placement and condition type are dropped first so
/// only one status/reason combination is exported at a time.
pub fn emit_placement_status_metric(metrics: &HubMetrics, placement: &Placement, cond: &Condition) {
    let namespace = placement.namespace.as_deref().unwrap_or("");
    let generation = placement.generation.to_string();
    metrics.placement_status_last_timestamp.delete_partial_match(&[
        ("namespace", namespace),
        ("name", &placement.name),
        ("conditionType", &cond.type_),
    ]);
    metrics.placement_status_last_timestamp.set(
        &[
            namespace,
            &placement.name,
            &generation,
            &cond.type_,
            cond.status.as_str(),
            &cond.reason,
        ],
        fleet_metrics::epoch_secs() as f64,
    );
}

/// Drop every status series of a placement.
pub fn delete_placement_status_metrics(metrics: &HubMetrics, placement: &Placement) -> usize {
    metrics.placement_status_last_timestamp.delete_partial_match(&[
        ("namespace", placement.namespace.as_deref().unwrap_or("")),
        ("name", &placement.name),
    ])
}

pub fn observe_cycle(metrics: &HubMetrics, elapsed: Duration, is_failed: bool, needs_requeue: bool) {
    metrics.scheduling_cycle_duration.observe(
        &[bool_label(is_failed), bool_label(needs_requeue)],
        elapsed.as_secs_f64() * 1000.0,
    );
}

/// Counts one running scheduling cycle for as long as it lives.
pub struct ActiveWorkerGuard<'a> {
    metrics: &'a HubMetrics,
}

impl<'a> ActiveWorkerGuard<'a> {
    pub fn new(metrics: &'a HubMetrics) -> Self {
        metrics.scheduling_active_workers.inc(&[]);
        Self { metrics }
    }
}

impl Drop for ActiveWorkerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.scheduling_active_workers.dec(&[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{ConditionStatus, PlacementPolicy, SCHEDULED_CONDITION};

    fn placement() -> Placement {
        Placement {
            namespace: None,
            name: "crp".to_string(),
            generation: 3,
            policy: PlacementPolicy::default(),
            finalizers: vec![],
            deletion_timestamp: None,
            conditions: vec![],
            resource_version: 1,
        }
    }

    #[test]
    fn status_metric_keeps_one_series_per_condition_type() {
        let m = HubMetrics::new();
        let p = placement();
        let unfulfilled = Condition::new(SCHEDULED_CONDITION, ConditionStatus::False, "Unfulfilled", "", 3, 0);
        let fulfilled = Condition::new(SCHEDULED_CONDITION, ConditionStatus::True, "Fulfilled", "", 3, 0);

        emit_placement_status_metric(&m, &p, &unfulfilled);
        emit_placement_status_metric(&m, &p, &fulfilled);

        assert_eq!(m.placement_status_last_timestamp.series_count(), 1);
        assert!(m
            .placement_status_last_timestamp
            .get(&["", "crp", "3", SCHEDULED_CONDITION, "True", "Fulfilled"])
            .is_some());

        assert_eq!(delete_placement_status_metrics(&m, &p), 1);
        assert_eq!(m.placement_status_last_timestamp.series_count(), 0);
    }

    #[test]
    fn active_worker_guard_balances() {
        let m = HubMetrics::new();
        {
            let _a = ActiveWorkerGuard::new(&m);
            let _b = ActiveWorkerGuard::new(&m);
            assert_eq!(m.scheduling_active_workers.get(&[]), Some(2.0));
        }
        assert_eq!(m.scheduling_active_workers.get(&[]), Some(0.0));
    }

    #[test]
    fn cycle_duration_is_labelled() {
        let m = HubMetrics::new();
        observe_cycle(&m, Duration::from_millis(20), false, true);
        assert_eq!(m.scheduling_cycle_duration.sample_count(&["false", "true"]), 1);
        assert!((m.scheduling_cycle_duration.sample_sum(&["false", "true"]) - 20.0).abs() < 1e-6);
    }
}
