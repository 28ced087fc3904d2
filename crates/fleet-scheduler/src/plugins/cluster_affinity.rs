//! ClusterAffinity — required and preferred cluster label terms.
//!
//! PreFilter stashes the snapshot's affinity terms in the cycle state (or
//! skips when there are none). Filter enforces the required labels; Score adds
//! the weight of every preferred term whose labels all match.

use std::collections::BTreeMap;

use fleet_state::{ClusterAffinityTerms, ClusterScore, MemberCluster, PolicySnapshot};

use crate::framework::{
    CycleContext, CycleState, FilterPlugin, Plugin, PreFilterPlugin, ScorePlugin, Status,
    StatusCode,
};

pub const CLUSTER_AFFINITY_PLUGIN: &str = "ClusterAffinity";

pub const REASON_NO_AFFINITY: &str = "no cluster affinity terms specified";
pub const REASON_LABELS_MISMATCH: &str = "cluster does not match the required cluster labels";

fn labels_match(cluster: &MemberCluster, wanted: &BTreeMap<String, String>) -> bool {
    wanted
        .iter()
        .all(|(k, v)| cluster.labels.get(k).is_some_and(|cv| cv == v))
}

#[derive(Debug, Clone)]
pub struct ClusterAffinity {
    name: String,
}

impl Default for ClusterAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterAffinity {
    pub fn new() -> Self {
        Self::with_name(CLUSTER_AFFINITY_PLUGIN)
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Terms stored by PreFilter, falling back to the snapshot itself.
    fn terms<'a>(
        &self,
        state: &'a CycleState,
        snapshot: &'a PolicySnapshot,
    ) -> Option<&'a ClusterAffinityTerms> {
        state
            .read::<ClusterAffinityTerms>(&self.name)
            .or(snapshot.policy.affinity.as_ref())
    }
}

impl Plugin for ClusterAffinity {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        Some(self)
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl PreFilterPlugin for ClusterAffinity {
    fn pre_filter(
        &self,
        _ctx: &CycleContext,
        state: &mut CycleState,
        snapshot: &PolicySnapshot,
    ) -> Status {
        match &snapshot.policy.affinity {
            Some(terms) if !terms.is_empty() => {
                state.write(&self.name, terms.clone());
                Status::success()
            }
            _ => Status::non_error(StatusCode::Skip, &self.name, REASON_NO_AFFINITY),
        }
    }
}

impl FilterPlugin for ClusterAffinity {
    fn filter(
        &self,
        _ctx: &CycleContext,
        state: &CycleState,
        snapshot: &PolicySnapshot,
        cluster: &MemberCluster,
    ) -> Status {
        let Some(terms) = self.terms(state, snapshot) else {
            return Status::success();
        };
        if labels_match(cluster, &terms.required_labels) {
            Status::success()
        } else {
            Status::non_error(StatusCode::ClusterUnschedulable, &self.name, REASON_LABELS_MISMATCH)
        }
    }
}

impl ScorePlugin for ClusterAffinity {
    fn score(
        &self,
        _ctx: &CycleContext,
        state: &CycleState,
        snapshot: &PolicySnapshot,
        cluster: &MemberCluster,
    ) -> Result<ClusterScore, Status> {
        let Some(terms) = self.terms(state, snapshot) else {
            return Ok(ClusterScore::default());
        };
        let affinity_score = terms
            .preferred
            .iter()
            .filter(|t| labels_match(cluster, &t.labels))
            .map(|t| t.weight)
            .sum();
        Ok(ClusterScore {
            affinity_score,
            topology_spread_score: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use fleet_state::{MemberClusterStatus, PlacementPolicy, PolicySnapshotStatus, PreferredClusterTerm};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn snapshot(affinity: Option<ClusterAffinityTerms>) -> PolicySnapshot {
        PolicySnapshot {
            namespace: None,
            name: "crp-0".to_string(),
            placement_name: "crp".to_string(),
            index: 0,
            generation: 1,
            policy: PlacementPolicy {
                affinity,
                ..Default::default()
            },
            status: PolicySnapshotStatus::default(),
            resource_version: 1,
        }
    }

    fn cluster(pairs: &[(&str, &str)]) -> MemberCluster {
        MemberCluster {
            name: "member-1".to_string(),
            labels: labels(pairs),
            leaving: false,
            status: MemberClusterStatus::default(),
            resource_version: 1,
        }
    }

    fn prepared(snap: &PolicySnapshot) -> (ClusterAffinity, CycleState, Status) {
        let p = ClusterAffinity::new();
        let mut state = CycleState::new(vec![], HashSet::new());
        let status = p.pre_filter(&CycleContext::background(), &mut state, snap);
        (p, state, status)
    }

    #[test]
    fn no_terms_skips() {
        let (_, _, status) = prepared(&snapshot(None));
        assert!(status.is_skip());
        let (_, _, status) = prepared(&snapshot(Some(ClusterAffinityTerms::default())));
        assert!(status.is_skip());
    }

    #[test]
    fn required_labels_filter() {
        let snap = snapshot(Some(ClusterAffinityTerms {
            required_labels: labels(&[("env", "prod")]),
            preferred: vec![],
        }));
        let (p, state, status) = prepared(&snap);
        assert!(status.is_success());
        assert!(state.read::<ClusterAffinityTerms>(CLUSTER_AFFINITY_PLUGIN).is_some());

        let ctx = CycleContext::background();
        assert!(p.filter(&ctx, &state, &snap, &cluster(&[("env", "prod"), ("zone", "a")])).is_success());

        let rejected = p.filter(&ctx, &state, &snap, &cluster(&[("env", "dev")]));
        assert_eq!(rejected.reason(), REASON_LABELS_MISMATCH);
        assert!(rejected.is_cluster_unschedulable());
        assert!(!p.filter(&ctx, &state, &snap, &cluster(&[])).is_success());
    }

    #[test]
    fn preferred_terms_add_weight() {
        let snap = snapshot(Some(ClusterAffinityTerms {
            required_labels: BTreeMap::new(),
            preferred: vec![
                PreferredClusterTerm { weight: 10, labels: labels(&[("zone", "a")]) },
                PreferredClusterTerm { weight: 5, labels: labels(&[("tier", "gold"), ("zone", "a")]) },
                PreferredClusterTerm { weight: -20, labels: labels(&[("spot", "true")]) },
            ],
        }));
        let (p, state, _) = prepared(&snap);
        let ctx = CycleContext::background();

        let s = p.score(&ctx, &state, &snap, &cluster(&[("zone", "a"), ("tier", "gold")])).unwrap();
        assert_eq!(s.affinity_score, 15);

        let s = p.score(&ctx, &state, &snap, &cluster(&[("zone", "a"), ("spot", "true")])).unwrap();
        assert_eq!(s.affinity_score, -10);

        let s = p.score(&ctx, &state, &snap, &cluster(&[])).unwrap();
        assert_eq!(s.total(), 0);
    }
}
