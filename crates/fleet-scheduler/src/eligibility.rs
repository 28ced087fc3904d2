//! Cluster eligibility — inventory-level checks applied before any plugin.

use std::time::Duration;

use fleet_core::ClusterConfig;
use fleet_state::MemberCluster;

pub const REASON_LEAVING: &str = "cluster is leaving the fleet";
pub const REASON_NO_HEARTBEAT: &str = "cluster has not reported a heartbeat";
pub const REASON_HEARTBEAT_STALE: &str = "cluster heartbeat is older than the unhealthy threshold";

/// Excludes clusters that are leaving or whose agent has gone quiet.
#[derive(Debug, Clone)]
pub struct ClusterEligibilityChecker {
    unhealthy_threshold: Duration,
}

impl ClusterEligibilityChecker {
    pub fn new(unhealthy_threshold: Duration) -> Self {
        Self { unhealthy_threshold }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(Duration::from_secs(config.unhealthy_threshold_secs))
    }

    /// Returns whether the cluster may be scheduled onto at `now` (Unix
    /// seconds) and, if not, why.
    pub fn check(&self, cluster: &MemberCluster, now: u64) -> (bool, &'static str) {
        if cluster.leaving {
            return (false, REASON_LEAVING);
        }
        match cluster.status.last_heartbeat {
            None => (false, REASON_NO_HEARTBEAT),
            Some(hb) if now.saturating_sub(hb) > self.unhealthy_threshold.as_secs() => {
                (false, REASON_HEARTBEAT_STALE)
            }
            Some(_) => (true, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::MemberClusterStatus;

    fn cluster(leaving: bool, heartbeat: Option<u64>) -> MemberCluster {
        MemberCluster {
            name: "member-1".to_string(),
            labels: Default::default(),
            leaving,
            status: MemberClusterStatus {
                last_heartbeat: heartbeat,
                ..Default::default()
            },
            resource_version: 1,
        }
    }

    #[test]
    fn healthy_cluster_is_eligible() {
        let checker = ClusterEligibilityChecker::new(Duration::from_secs(60));
        assert_eq!(checker.check(&cluster(false, Some(1000)), 1030), (true, ""));
        // Exactly at the threshold is still healthy.
        assert!(checker.check(&cluster(false, Some(1000)), 1060).0);
    }

    #[test]
    fn leaving_cluster_is_excluded() {
        let checker = ClusterEligibilityChecker::new(Duration::from_secs(60));
        assert_eq!(checker.check(&cluster(true, Some(1000)), 1000), (false, REASON_LEAVING));
    }

    #[test]
    fn stale_or_missing_heartbeat_is_excluded() {
        let checker = ClusterEligibilityChecker::from_config(&ClusterConfig::default());
        assert_eq!(
            checker.check(&cluster(false, Some(1000)), 1061),
            (false, REASON_HEARTBEAT_STALE)
        );
        assert_eq!(checker.check(&cluster(false, None), 1000), (false, REASON_NO_HEARTBEAT));
    }

    #[test]
    fn heartbeat_from_the_future_is_tolerated() {
        let checker = ClusterEligibilityChecker::new(Duration::from_secs(60));
        assert!(checker.check(&cluster(false, Some(2000)), 1000).0);
    }
}
