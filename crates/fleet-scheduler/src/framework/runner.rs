//! Runs a profile's plugins over the candidates of one cycle.

use std::collections::HashSet;

use fleet_state::{ClusterScore, MemberCluster, PolicySnapshot};
use tracing::debug;

use crate::error::{FrameworkError, FrameworkResult};
use crate::framework::cycle_state::CycleState;
use crate::framework::plugin::CycleContext;
use crate::framework::profile::Profile;
use crate::framework::status::{Status, StatusCode};

/// A cluster that passed every active Filter, with its summed score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredCluster {
    pub cluster_name: String,
    pub score: ClusterScore,
}

/// Result of running the pipeline over all candidates.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Feasible clusters, in candidate order.
    pub feasible: Vec<ScoredCluster>,
    /// Rejected clusters with the first rejecting status.
    pub rejected: Vec<(String, Status)>,
    /// Plugins that opted out at PreFilter.
    pub skipped_plugins: HashSet<String>,
}

pub struct Framework {
    profile: Profile,
}

impl Framework {
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Call every PreFilter plugin once, in registration order. Returns the
    /// names of plugins that returned Skip.
    pub fn run_pre_filter_plugins(
        &self,
        ctx: &CycleContext,
        state: &mut CycleState,
        snapshot: &PolicySnapshot,
    ) -> FrameworkResult<HashSet<String>> {
        let mut skipped = HashSet::new();
        for plugin in self.profile.plugins() {
            let Some(pf) = plugin.as_pre_filter() else {
                continue;
            };
            ctx.check()?;
            let status = pf.pre_filter(ctx, state, snapshot);
            match status.code() {
                StatusCode::Success => {}
                StatusCode::Skip => {
                    debug!(plugin = %plugin.name(), reason = %status.reason(), "plugin skipped for cycle");
                    skipped.insert(plugin.name().to_string());
                }
                StatusCode::ClusterUnschedulable | StatusCode::InternalError => {
                    return Err(FrameworkError::PluginFailed {
                        plugin: plugin.name().to_string(),
                        extension_point: "PreFilter",
                        status,
                    });
                }
            }
        }
        Ok(skipped)
    }

    /// Run the active Filter plugins against one cluster. Returns Success or
    /// the first ClusterUnschedulable status; Skip from Filter counts as a pass.
    pub fn run_filter_plugins(
        &self,
        ctx: &CycleContext,
        state: &CycleState,
        skipped: &HashSet<String>,
        snapshot: &PolicySnapshot,
        cluster: &MemberCluster,
    ) -> FrameworkResult<Status> {
        for plugin in self.profile.plugins() {
            if skipped.contains(plugin.name()) {
                continue;
            }
            let Some(f) = plugin.as_filter() else {
                continue;
            };
            ctx.check()?;
            let status = f.filter(ctx, state, snapshot, cluster);
            match status.code() {
                StatusCode::Success | StatusCode::Skip => {}
                StatusCode::ClusterUnschedulable => return Ok(status),
                StatusCode::InternalError => {
                    return Err(FrameworkError::PluginFailed {
                        plugin: plugin.name().to_string(),
                        extension_point: "Filter",
                        status,
                    });
                }
            }
        }
        Ok(Status::success())
    }

    /// Sum the active Score plugins for one cluster.
    pub fn run_score_plugins(
        &self,
        ctx: &CycleContext,
        state: &CycleState,
        skipped: &HashSet<String>,
        snapshot: &PolicySnapshot,
        cluster: &MemberCluster,
    ) -> FrameworkResult<ClusterScore> {
        let mut total = ClusterScore::default();
        for plugin in self.profile.plugins() {
            if skipped.contains(plugin.name()) {
                continue;
            }
            let Some(s) = plugin.as_score() else {
                continue;
            };
            ctx.check()?;
            match s.score(ctx, state, snapshot, cluster) {
                Ok(score) => total.add(score),
                Err(status) if status.is_skip() => {}
                Err(status) => {
                    return Err(FrameworkError::PluginFailed {
                        plugin: plugin.name().to_string(),
                        extension_point: "Score",
                        status,
                    });
                }
            }
        }
        Ok(total)
    }

    /// PreFilter once, then Filter and Score every candidate in `state`.
    pub fn evaluate(
        &self,
        ctx: &CycleContext,
        state: &mut CycleState,
        snapshot: &PolicySnapshot,
    ) -> FrameworkResult<Evaluation> {
        let skipped = self.run_pre_filter_plugins(ctx, state, snapshot)?;
        let state: &CycleState = state;

        let mut eval = Evaluation::default();
        for cluster in state.list_clusters() {
            let status = self.run_filter_plugins(ctx, state, &skipped, snapshot, cluster)?;
            if !status.is_success() {
                debug!(
                    cluster = %cluster.name,
                    plugin = %status.plugin_name(),
                    reason = %status.reason(),
                    "cluster rejected"
                );
                eval.rejected.push((cluster.name.clone(), status));
                continue;
            }
            let score = self.run_score_plugins(ctx, state, &skipped, snapshot, cluster)?;
            eval.feasible.push(ScoredCluster {
                cluster_name: cluster.name.clone(),
                score,
            });
        }
        eval.skipped_plugins = skipped;
        Ok(eval)
    }
}
