//! Domain types for the fleet state store.
//!
//! These types represent placements, their immutable policy snapshots, the
//! member-cluster inventory and the per-cluster bindings the scheduler
//! produces. All types are serializable to/from JSON for storage in redb
//! tables. Update-run types live in [`crate::update_run`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// Finalizer the scheduler puts on a placement so its bindings are always
/// cleaned up before the placement disappears.
pub const SCHEDULER_CLEANUP_FINALIZER: &str = "fleet.io/scheduler-cleanup";

/// Condition type reported on placements and policy snapshots.
pub const SCHEDULED_CONDITION: &str = "Scheduled";

/// Member-cluster condition that signals namespace inventory collection is enabled.
pub const NAMESPACE_COLLECTION_SUCCEEDED_CONDITION: &str = "NamespaceCollectionSucceeded";

// ── Keys ──────────────────────────────────────────────────────────

/// Namespace/name identity of a stored object.
///
/// `namespace == None` means the object is cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster_scoped(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Build the composite key for namespaced tables.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace.as_deref().unwrap_or(""), self.name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

// ── Placement ─────────────────────────────────────────────────────

/// An intent to deploy resources onto some subset of fleet clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// `None` for fleet-wide placements, `Some(ns)` for namespace-scoped ones.
    pub namespace: Option<String>,
    pub name: String,
    pub generation: i64,
    pub policy: PlacementPolicy,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Set when deletion was requested but finalizers are still present.
    #[serde(default)]
    pub deletion_timestamp: Option<u64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub resource_version: u64,
}

impl Placement {
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// The scheduling policy carried by a placement and captured in snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlacementPolicy {
    pub placement_type: PlacementType,
    #[serde(default)]
    pub affinity: Option<ClusterAffinityTerms>,
}

/// How many clusters a placement selects.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementType {
    /// Every eligible cluster.
    #[default]
    PickAll,
    /// Exactly the named clusters, if eligible.
    PickFixed { cluster_names: Vec<String> },
    /// The best `number_of_clusters` eligible clusters by score.
    PickN { number_of_clusters: u32 },
}

/// Label-based cluster affinity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterAffinityTerms {
    /// All of these labels must match for a cluster to be eligible.
    #[serde(default)]
    pub required_labels: BTreeMap<String, String>,
    /// Soft preferences, each adding its weight to the score when matched.
    #[serde(default)]
    pub preferred: Vec<PreferredClusterTerm>,
}

impl ClusterAffinityTerms {
    pub fn is_empty(&self) -> bool {
        self.required_labels.is_empty() && self.preferred.is_empty()
    }
}

/// A weighted soft label preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredClusterTerm {
    pub weight: i32,
    pub labels: BTreeMap<String, String>,
}

// ── Policy snapshot ───────────────────────────────────────────────

/// Immutable capture of a placement's scheduling policy at one index.
///
/// Only the status is ever rewritten; a policy change produces a new
/// snapshot with a higher index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub namespace: Option<String>,
    pub name: String,
    pub placement_name: String,
    pub index: u32,
    pub generation: i64,
    pub policy: PlacementPolicy,
    #[serde(default)]
    pub status: PolicySnapshotStatus,
    #[serde(default)]
    pub resource_version: u64,
}

impl PolicySnapshot {
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Conventional snapshot name for a placement at `index`.
    pub fn name_for(placement_name: &str, index: u32) -> String {
        format!("{placement_name}-{index}")
    }
}

/// Scheduler-written status of a policy snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicySnapshotStatus {
    pub conditions: Vec<Condition>,
    pub cluster_decisions: Vec<ClusterDecision>,
}

/// The scheduler's verdict for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDecision {
    pub cluster_name: String,
    pub selected: bool,
    #[serde(default)]
    pub score: Option<ClusterScore>,
    pub reason: String,
}

/// Aggregated plugin score for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterScore {
    pub affinity_score: i32,
    pub topology_spread_score: i32,
}

impl ClusterScore {
    pub fn add(&mut self, other: ClusterScore) {
        self.affinity_score += other.affinity_score;
        self.topology_spread_score += other.topology_spread_score;
    }

    pub fn total(&self) -> i64 {
        i64::from(self.affinity_score) + i64::from(self.topology_spread_score)
    }
}

// ── Member cluster ────────────────────────────────────────────────

/// A fleet member as seen from the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberCluster {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Set once the cluster asked to leave the fleet.
    #[serde(default)]
    pub leaving: bool,
    #[serde(default)]
    pub status: MemberClusterStatus,
    #[serde(default)]
    pub resource_version: u64,
}

/// Status reported by the member agent and property collectors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemberClusterStatus {
    pub conditions: Vec<Condition>,
    /// Namespace name → representative work name. `None` when no inventory
    /// has been collected.
    #[serde(default)]
    pub namespaces: Option<BTreeMap<String, String>>,
    /// Unix timestamp (seconds) of the last agent heartbeat.
    #[serde(default)]
    pub last_heartbeat: Option<u64>,
}

// ── Binding ───────────────────────────────────────────────────────

/// Lifecycle state of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    /// Picked by the scheduler, not yet rolled out.
    Scheduled,
    /// Rolled out to the target cluster.
    Bound,
    /// No longer desired; awaiting cleanup.
    Unscheduled,
}

/// Materialized assignment of a placement to one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub namespace: Option<String>,
    pub name: String,
    pub placement_name: String,
    pub target_cluster: String,
    pub policy_snapshot_name: String,
    pub state: BindingState,
    pub cluster_decision: ClusterDecision,
    /// Update run that last bound this binding, if any.
    #[serde(default)]
    pub update_run: Option<String>,
    #[serde(default)]
    pub resource_version: u64,
}

impl Binding {
    /// Conventional binding name for a placement/cluster pair.
    pub fn name_for(placement_name: &str, cluster_name: &str) -> String {
        format!("{placement_name}-{cluster_name}")
    }

    /// Build the composite key for the bindings table.
    pub fn table_key(&self) -> String {
        binding_table_key(self.namespace.as_deref(), &self.placement_name, &self.target_cluster)
    }
}

/// Composite binding key, prefix-scannable by placement.
pub fn binding_table_key(namespace: Option<&str>, placement_name: &str, cluster_name: &str) -> String {
    format!("{}/{placement_name}:{cluster_name}", namespace.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_display_and_table_key() {
        let ns = ObjectKey::namespaced("team-a", "web");
        assert_eq!(ns.to_string(), "team-a/web");
        assert_eq!(ns.table_key(), "team-a/web");

        let cs = ObjectKey::cluster_scoped("web");
        assert_eq!(cs.to_string(), "web");
        assert_eq!(cs.table_key(), "/web");
    }

    #[test]
    fn placement_type_serializes_tagged() {
        let t = PlacementType::PickN { number_of_clusters: 3 };
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"type":"pick_n","number_of_clusters":3}"#);
    }

    #[test]
    fn cluster_score_total_sums_components() {
        let mut s = ClusterScore { affinity_score: 3, topology_spread_score: 0 };
        s.add(ClusterScore { affinity_score: 2, topology_spread_score: -1 });
        assert_eq!(s.total(), 4);
    }

    #[test]
    fn binding_keys_group_by_placement() {
        assert_eq!(binding_table_key(Some("ns"), "rp", "c1"), "ns/rp:c1");
        assert_eq!(binding_table_key(None, "crp", "c1"), "/crp:c1");
    }
}
