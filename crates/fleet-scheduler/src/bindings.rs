//! Binding reconciler — turns the selected clusters into binding writes.
//!
//! [`plan_bindings`] is a pure diff of desired decisions against existing
//! bindings. [`BindingReconciler`] applies the plan; a write conflict on one
//! binding re-reads and re-plans only that binding.

use std::collections::{BTreeSet, HashMap};

use fleet_state::{
    Binding, BindingState, ClusterDecision, Placement, PolicySnapshot, StateError, StateResult,
    StateStore,
};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// One binding write.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingAction {
    Create(Binding),
    /// Refresh snapshot name / decision, or bring an unscheduled binding back.
    Update(Binding),
    /// A bound binding that is no longer desired.
    MarkUnscheduled(Binding),
    /// A scheduled binding that never got bound and is no longer desired.
    Delete(Binding),
}

impl BindingAction {
    pub fn binding(&self) -> &Binding {
        match self {
            Self::Create(b) | Self::Update(b) | Self::MarkUnscheduled(b) | Self::Delete(b) => b,
        }
    }
}

/// Counts of applied writes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BindingChanges {
    pub created: usize,
    pub updated: usize,
    pub unscheduled: usize,
    pub deleted: usize,
}

impl BindingChanges {
    pub fn is_empty(&self) -> bool {
        self.created + self.updated + self.unscheduled + self.deleted == 0
    }

    fn record(&mut self, action: &BindingAction) {
        match action {
            BindingAction::Create(_) => self.created += 1,
            BindingAction::Update(_) => self.updated += 1,
            BindingAction::MarkUnscheduled(_) => self.unscheduled += 1,
            BindingAction::Delete(_) => self.deleted += 1,
        }
    }
}

/// Decide the write, if any, for one cluster.
pub fn plan_for_cluster(
    placement: &Placement,
    snapshot: &PolicySnapshot,
    desired: Option<&ClusterDecision>,
    existing: Option<&Binding>,
) -> Option<BindingAction> {
    match (desired, existing) {
        (Some(decision), None) => Some(BindingAction::Create(Binding {
            namespace: placement.namespace.clone(),
            name: Binding::name_for(&placement.name, &decision.cluster_name),
            placement_name: placement.name.clone(),
            target_cluster: decision.cluster_name.clone(),
            policy_snapshot_name: snapshot.name.clone(),
            state: BindingState::Scheduled,
            cluster_decision: decision.clone(),
            update_run: None,
            resource_version: 0,
        })),
        (Some(decision), Some(b)) => {
            let state = match b.state {
                BindingState::Unscheduled => BindingState::Scheduled,
                s => s,
            };
            if state == b.state
                && b.policy_snapshot_name == snapshot.name
                && b.cluster_decision == *decision
            {
                return None;
            }
            let mut next = b.clone();
            next.state = state;
            next.policy_snapshot_name = snapshot.name.clone();
            next.cluster_decision = decision.clone();
            Some(BindingAction::Update(next))
        }
        (None, Some(b)) => match b.state {
            BindingState::Scheduled => Some(BindingAction::Delete(b.clone())),
            BindingState::Bound => {
                let mut next = b.clone();
                next.state = BindingState::Unscheduled;
                Some(BindingAction::MarkUnscheduled(next))
            }
            BindingState::Unscheduled => None,
        },
        (None, None) => None,
    }
}

/// Diff the selected decisions against the placement's existing bindings.
/// Actions are ordered by cluster name.
pub fn plan_bindings(
    placement: &Placement,
    snapshot: &PolicySnapshot,
    desired: &[ClusterDecision],
    existing: &[Binding],
) -> Vec<BindingAction> {
    let desired: HashMap<&str, &ClusterDecision> =
        desired.iter().map(|d| (d.cluster_name.as_str(), d)).collect();
    let existing: HashMap<&str, &Binding> =
        existing.iter().map(|b| (b.target_cluster.as_str(), b)).collect();
    let clusters: BTreeSet<&str> = desired.keys().chain(existing.keys()).copied().collect();

    clusters
        .into_iter()
        .filter_map(|c| {
            plan_for_cluster(
                placement,
                snapshot,
                desired.get(c).copied(),
                existing.get(c).copied(),
            )
        })
        .collect()
}

/// Applies binding plans against the state store.
#[derive(Clone)]
pub struct BindingReconciler {
    store: StateStore,
    max_attempts: u32,
}

impl BindingReconciler {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Bring the placement's bindings in line with `desired`.
    pub fn reconcile(
        &self,
        placement: &Placement,
        snapshot: &PolicySnapshot,
        desired: &[ClusterDecision],
    ) -> SchedulerResult<BindingChanges> {
        let existing = self.store.list_bindings_for_placement(&placement.key())?;
        let by_cluster: HashMap<&str, &ClusterDecision> =
            desired.iter().map(|d| (d.cluster_name.as_str(), d)).collect();

        let mut changes = BindingChanges::default();
        for action in plan_bindings(placement, snapshot, desired, &existing) {
            let cluster = action.binding().target_cluster.clone();
            let wanted = by_cluster.get(cluster.as_str()).copied();
            self.apply_with_retry(placement, snapshot, wanted, action, &mut changes)?;
        }
        if !changes.is_empty() {
            debug!(placement = %placement.key(), ?changes, "bindings reconciled");
        }
        Ok(changes)
    }

    /// Perform a single write.
    pub fn apply(&self, action: &BindingAction) -> StateResult<()> {
        match action {
            BindingAction::Create(b) => {
                self.store.create_binding(b)?;
            }
            BindingAction::Update(b) | BindingAction::MarkUnscheduled(b) => {
                self.store.update_binding(b)?;
            }
            BindingAction::Delete(b) => {
                self.store.delete_binding(b)?;
            }
        }
        debug!(binding = %action.binding().name, ?action, "binding written");
        Ok(())
    }

    fn apply_with_retry(
        &self,
        placement: &Placement,
        snapshot: &PolicySnapshot,
        desired: Option<&ClusterDecision>,
        action: BindingAction,
        changes: &mut BindingChanges,
    ) -> SchedulerResult<()> {
        let mut next = Some(action);
        let mut attempt = 0;
        while let Some(action) = next {
            attempt += 1;
            let err = match self.apply(&action) {
                Ok(()) => {
                    changes.record(&action);
                    return Ok(());
                }
                Err(e) => e,
            };
            let stale = matches!(
                err,
                StateError::Conflict { .. } | StateError::AlreadyExists(_) | StateError::NotFound(_)
            );
            if !stale {
                return Err(err.into());
            }
            let binding = action.binding();
            if attempt >= self.max_attempts {
                return Err(SchedulerError::BindingConflict {
                    binding: binding.name.clone(),
                    attempts: attempt,
                });
            }
            debug!(binding = %binding.name, attempt, error = %err, "stale binding, re-planning");
            let current = self.store.get_binding(
                binding.namespace.as_deref(),
                &binding.placement_name,
                &binding.target_cluster,
            )?;
            next = plan_for_cluster(placement, snapshot, desired, current.as_ref());
        }
        Ok(())
    }

    /// Delete every binding of `placement`, whatever its state. Returns the
    /// number deleted.
    pub fn delete_all(&self, placement: &Placement) -> SchedulerResult<usize> {
        let mut deleted = 0;
        for binding in self.store.list_bindings_for_placement(&placement.key())? {
            let mut current = Some(binding);
            let mut attempt = 0;
            while let Some(b) = current.take() {
                attempt += 1;
                match self.store.delete_binding(&b) {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) if e.is_conflict() && attempt < self.max_attempts => {
                        current = self.store.get_binding(
                            b.namespace.as_deref(),
                            &b.placement_name,
                            &b.target_cluster,
                        )?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{PlacementPolicy, PolicySnapshotStatus};

    fn placement() -> Placement {
        Placement {
            namespace: Some("team-a".to_string()),
            name: "web".to_string(),
            generation: 1,
            policy: PlacementPolicy::default(),
            finalizers: vec![],
            deletion_timestamp: None,
            conditions: vec![],
            resource_version: 1,
        }
    }

    fn snapshot(index: u32) -> PolicySnapshot {
        PolicySnapshot {
            namespace: Some("team-a".to_string()),
            name: PolicySnapshot::name_for("web", index),
            placement_name: "web".to_string(),
            index,
            generation: 1,
            policy: PlacementPolicy::default(),
            status: PolicySnapshotStatus::default(),
            resource_version: 1,
        }
    }

    fn decision(cluster: &str) -> ClusterDecision {
        ClusterDecision {
            cluster_name: cluster.to_string(),
            selected: true,
            score: None,
            reason: "picked by scheduling policy".to_string(),
        }
    }

    fn existing(cluster: &str, state: BindingState, snap: &PolicySnapshot) -> Binding {
        let Some(BindingAction::Create(mut b)) =
            plan_for_cluster(&placement(), snap, Some(&decision(cluster)), None)
        else {
            panic!("expected create");
        };
        b.state = state;
        b.resource_version = 1;
        b
    }

    #[test]
    fn plan_creates_missing_bindings() {
        let snap = snapshot(0);
        let plan = plan_bindings(&placement(), &snap, &[decision("c2"), decision("c1")], &[]);
        let clusters: Vec<&str> = plan.iter().map(|a| a.binding().target_cluster.as_str()).collect();
        assert_eq!(clusters, vec!["c1", "c2"]);
        assert!(plan.iter().all(|a| matches!(a, BindingAction::Create(_))));
        assert_eq!(plan[0].binding().name, "web-c1");
        assert_eq!(plan[0].binding().policy_snapshot_name, "web-0");
    }

    #[test]
    fn plan_is_empty_when_nothing_changed() {
        let snap = snapshot(0);
        let have = vec![existing("c1", BindingState::Bound, &snap)];
        assert!(plan_bindings(&placement(), &snap, &[decision("c1")], &have).is_empty());
    }

    #[test]
    fn plan_refreshes_snapshot_name_keeping_state() {
        let have = vec![existing("c1", BindingState::Bound, &snapshot(0))];
        let plan = plan_bindings(&placement(), &snapshot(1), &[decision("c1")], &have);
        match &plan[..] {
            [BindingAction::Update(b)] => {
                assert_eq!(b.policy_snapshot_name, "web-1");
                assert_eq!(b.state, BindingState::Bound);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn plan_handles_obsolete_bindings_by_state() {
        let snap = snapshot(0);
        let have = vec![
            existing("c1", BindingState::Scheduled, &snap),
            existing("c2", BindingState::Bound, &snap),
            existing("c3", BindingState::Unscheduled, &snap),
        ];
        let plan = plan_bindings(&placement(), &snap, &[], &have);
        assert_eq!(plan.len(), 2);
        assert!(matches!(&plan[0], BindingAction::Delete(b) if b.target_cluster == "c1"));
        assert!(matches!(
            &plan[1],
            BindingAction::MarkUnscheduled(b) if b.target_cluster == "c2" && b.state == BindingState::Unscheduled
        ));
    }

    #[test]
    fn plan_reschedules_unscheduled_binding() {
        let snap = snapshot(0);
        let have = vec![existing("c1", BindingState::Unscheduled, &snap)];
        let plan = plan_bindings(&placement(), &snap, &[decision("c1")], &have);
        assert!(matches!(&plan[..], [BindingAction::Update(b)] if b.state == BindingState::Scheduled));
    }

    #[test]
    fn reconcile_writes_and_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = BindingReconciler::new(store.clone());
        let snap = snapshot(0);

        let changes = rec.reconcile(&placement(), &snap, &[decision("c1"), decision("c2")]).unwrap();
        assert_eq!(changes.created, 2);

        let again = rec.reconcile(&placement(), &snap, &[decision("c1"), decision("c2")]).unwrap();
        assert!(again.is_empty());

        let shrink = rec.reconcile(&placement(), &snap, &[decision("c1")]).unwrap();
        assert_eq!(shrink.deleted, 1);
        assert_eq!(store.list_bindings().unwrap().len(), 1);
    }

    #[test]
    fn conflict_retries_only_that_binding() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = BindingReconciler::new(store.clone());
        let snap0 = snapshot(0);
        rec.reconcile(&placement(), &snap0, &[decision("c1")]).unwrap();

        // Someone else bumps the binding after we planned.
        let stale = store.get_binding(Some("team-a"), "web", "c1").unwrap().unwrap();
        let mut bound = stale.clone();
        bound.state = BindingState::Bound;
        store.update_binding(&bound).unwrap();

        let snap1 = snapshot(1);
        let action = plan_for_cluster(&placement(), &snap1, Some(&decision("c1")), Some(&stale)).unwrap();
        let mut changes = BindingChanges::default();
        rec.apply_with_retry(&placement(), &snap1, Some(&decision("c1")), action, &mut changes)
            .unwrap();
        assert_eq!(changes.updated, 1);

        let now = store.get_binding(Some("team-a"), "web", "c1").unwrap().unwrap();
        assert_eq!(now.policy_snapshot_name, "web-1");
        // The concurrent state change survived the retry.
        assert_eq!(now.state, BindingState::Bound);
    }

    #[test]
    fn delete_all_removes_every_state() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = BindingReconciler::new(store.clone());
        let snap = snapshot(0);
        rec.reconcile(&placement(), &snap, &[decision("c1"), decision("c2")]).unwrap();
        let mut b = store.get_binding(Some("team-a"), "web", "c2").unwrap().unwrap();
        b.state = BindingState::Bound;
        store.update_binding(&b).unwrap();

        assert_eq!(rec.delete_all(&placement()).unwrap(), 2);
        assert!(store.list_bindings().unwrap().is_empty());
    }
}
