//! Stage planning — assigns every bound or scheduled cluster to exactly one
//! operator-declared stage.

use std::collections::{BTreeMap, HashMap, HashSet};

use fleet_state::{
    Binding, BindingState, MemberCluster, StageDefinition, StageStatus, StageTaskStatus,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("stage {0} is declared more than once")]
    DuplicateStage(String),

    #[error("placement has no scheduled or bound clusters")]
    NoClusters,

    #[error("cluster {0} is not a member of the fleet")]
    ClusterNotFound(String),

    #[error("cluster {cluster} matches both stage {first} and stage {second}")]
    ClusterInMultipleStages {
        cluster: String,
        first: String,
        second: String,
    },

    #[error("cluster {0} does not match any stage")]
    ClusterNotInAnyStage(String),
}

fn labels_match(labels: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Compute the ordered stage plan for a run.
///
/// Targets are the placement's bindings that are not unscheduled. Stages
/// keep their declared order, tasks within a stage are sorted by cluster
/// name. A stage may end up empty.
pub fn compute_stage_plan(
    stages: &[StageDefinition],
    bindings: &[Binding],
    clusters: &[MemberCluster],
) -> Result<Vec<StageStatus>, PlanError> {
    let mut names = HashSet::new();
    for stage in stages {
        if !names.insert(stage.name.as_str()) {
            return Err(PlanError::DuplicateStage(stage.name.clone()));
        }
    }

    let mut targets: Vec<&str> = bindings
        .iter()
        .filter(|b| b.state != BindingState::Unscheduled)
        .map(|b| b.target_cluster.as_str())
        .collect();
    targets.sort_unstable();
    targets.dedup();
    if targets.is_empty() {
        return Err(PlanError::NoClusters);
    }

    let inventory: HashMap<&str, &MemberCluster> =
        clusters.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut assigned: Vec<Vec<&str>> = vec![Vec::new(); stages.len()];
    for cluster in targets {
        let member = inventory
            .get(cluster)
            .ok_or_else(|| PlanError::ClusterNotFound(cluster.to_string()))?;
        let mut matched: Option<usize> = None;
        for (i, stage) in stages.iter().enumerate() {
            if !labels_match(&member.labels, &stage.cluster_labels) {
                continue;
            }
            if let Some(first) = matched {
                return Err(PlanError::ClusterInMultipleStages {
                    cluster: cluster.to_string(),
                    first: stages[first].name.clone(),
                    second: stage.name.clone(),
                });
            }
            matched = Some(i);
        }
        let i = matched.ok_or_else(|| PlanError::ClusterNotInAnyStage(cluster.to_string()))?;
        assigned[i].push(cluster);
    }

    Ok(stages
        .iter()
        .zip(assigned)
        .map(|(stage, clusters)| {
            let tasks = clusters
                .into_iter()
                .map(|c| StageTaskStatus::new(c, stage.requires_approval))
                .collect();
            StageStatus::new(&stage.name, tasks)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{ClusterDecision, MemberClusterStatus, StagePhase, TaskPhase};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn member(name: &str, env: &str) -> MemberCluster {
        MemberCluster {
            name: name.to_string(),
            labels: labels(&[("env", env)]),
            leaving: false,
            status: MemberClusterStatus::default(),
            resource_version: 1,
        }
    }

    fn binding(cluster: &str, state: BindingState) -> Binding {
        Binding {
            namespace: None,
            name: Binding::name_for("crp", cluster),
            placement_name: "crp".to_string(),
            target_cluster: cluster.to_string(),
            policy_snapshot_name: "crp-0".to_string(),
            state,
            cluster_decision: ClusterDecision {
                cluster_name: cluster.to_string(),
                selected: true,
                score: None,
                reason: String::new(),
            },
            update_run: None,
            resource_version: 1,
        }
    }

    fn stage(name: &str, env: &str, approval: bool) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            cluster_labels: labels(&[("env", env)]),
            requires_approval: approval,
            max_concurrency: None,
        }
    }

    #[test]
    fn clusters_land_in_their_stage_in_order() {
        let stages = vec![stage("canary", "canary", false), stage("prod", "prod", true)];
        let clusters = vec![member("p2", "prod"), member("c1", "canary"), member("p1", "prod")];
        let bindings = vec![
            binding("p2", BindingState::Bound),
            binding("p1", BindingState::Scheduled),
            binding("c1", BindingState::Scheduled),
        ];
        let plan = compute_stage_plan(&stages, &bindings, &clusters).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].name, "canary");
        assert_eq!(plan[0].phase, StagePhase::Pending);
        let prod: Vec<&str> = plan[1].tasks.iter().map(|t| t.cluster_name.as_str()).collect();
        assert_eq!(prod, vec!["p1", "p2"]);
        assert!(plan[1].tasks.iter().all(|t| t.requires_approval && t.phase == TaskPhase::Pending));
        assert!(!plan[0].tasks[0].requires_approval);
    }

    #[test]
    fn unscheduled_bindings_are_not_targets() {
        let stages = vec![stage("all", "prod", false), stage("empty", "dev", false)];
        let clusters = vec![member("p1", "prod"), member("d1", "dev")];
        let bindings = vec![
            binding("p1", BindingState::Bound),
            binding("d1", BindingState::Unscheduled),
        ];
        let plan = compute_stage_plan(&stages, &bindings, &clusters).unwrap();
        assert_eq!(plan[0].tasks.len(), 1);
        assert!(plan[1].tasks.is_empty());
    }

    #[test]
    fn ambiguous_or_unmatched_clusters_fail() {
        let clusters = vec![member("p1", "prod")];
        let bindings = vec![binding("p1", BindingState::Scheduled)];

        let mut wide = stage("wide", "prod", false);
        wide.cluster_labels.clear();
        let err = compute_stage_plan(&[stage("prod", "prod", false), wide], &bindings, &clusters)
            .unwrap_err();
        assert!(matches!(err, PlanError::ClusterInMultipleStages { ref second, .. } if second == "wide"));

        let err = compute_stage_plan(&[stage("dev", "dev", false)], &bindings, &clusters).unwrap_err();
        assert_eq!(err, PlanError::ClusterNotInAnyStage("p1".to_string()));
    }

    #[test]
    fn plan_rejects_bad_inputs() {
        let clusters = vec![member("p1", "prod")];
        assert_eq!(
            compute_stage_plan(&[stage("a", "prod", false)], &[], &clusters).unwrap_err(),
            PlanError::NoClusters
        );
        assert_eq!(
            compute_stage_plan(
                &[stage("a", "prod", false), stage("a", "dev", false)],
                &[binding("p1", BindingState::Bound)],
                &clusters
            )
            .unwrap_err(),
            PlanError::DuplicateStage("a".to_string())
        );
        assert_eq!(
            compute_stage_plan(&[stage("a", "prod", false)], &[binding("gone", BindingState::Bound)], &clusters)
                .unwrap_err(),
            PlanError::ClusterNotFound("gone".to_string())
        );
    }
}
