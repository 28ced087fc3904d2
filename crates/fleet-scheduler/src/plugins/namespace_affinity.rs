//! NamespaceAffinity — only place namespace-scoped workloads on clusters
//! where the target namespace exists.
//!
//! Clusters that never enabled namespace collection (no
//! `NamespaceCollectionSucceeded` condition) are always eligible. Once the
//! condition is present, True or False, the reported inventory is trusted.

use fleet_state::{
    MemberCluster, NAMESPACE_COLLECTION_SUCCEEDED_CONDITION, PolicySnapshot, find_condition,
};

use crate::framework::{
    CycleContext, CycleState, FilterPlugin, Plugin, PreFilterPlugin, Status, StatusCode,
};

pub const NAMESPACE_AFFINITY_PLUGIN: &str = "NamespaceAffinity";

pub const REASON_CLUSTER_SCOPED: &str =
    "cluster-scoped placement does not require namespace affinity filtering";
pub const REASON_NO_NAMESPACE_INFO: &str = "cluster has no namespace information available";
pub const REASON_NAMESPACE_MISSING: &str = "target namespace does not exist on cluster";

#[derive(Debug, Clone)]
pub struct NamespaceAffinity {
    name: String,
}

impl Default for NamespaceAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceAffinity {
    pub fn new() -> Self {
        Self::with_name(NAMESPACE_AFFINITY_PLUGIN)
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Plugin for NamespaceAffinity {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        Some(self)
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }
}

impl PreFilterPlugin for NamespaceAffinity {
    fn pre_filter(
        &self,
        _ctx: &CycleContext,
        _state: &mut CycleState,
        snapshot: &PolicySnapshot,
    ) -> Status {
        match snapshot.namespace.as_deref() {
            None | Some("") => Status::non_error(StatusCode::Skip, &self.name, REASON_CLUSTER_SCOPED),
            Some(_) => Status::success(),
        }
    }
}

impl FilterPlugin for NamespaceAffinity {
    fn filter(
        &self,
        _ctx: &CycleContext,
        _state: &CycleState,
        snapshot: &PolicySnapshot,
        cluster: &MemberCluster,
    ) -> Status {
        let ns = snapshot.namespace.as_deref().unwrap_or_default();

        if find_condition(&cluster.status.conditions, NAMESPACE_COLLECTION_SUCCEEDED_CONDITION).is_none() {
            return Status::success();
        }
        let Some(namespaces) = &cluster.status.namespaces else {
            return Status::non_error(
                StatusCode::ClusterUnschedulable,
                &self.name,
                REASON_NO_NAMESPACE_INFO,
            );
        };
        if !namespaces.contains_key(ns) {
            return Status::non_error(
                StatusCode::ClusterUnschedulable,
                &self.name,
                REASON_NAMESPACE_MISSING,
            );
        }
        Status::success()
    }
}
