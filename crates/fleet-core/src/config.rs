//! fleet.toml configuration parser.
//!
//! Every section is optional and falls back to the hub defaults. Values are
//! consumed as already validated; nothing here range-checks them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub controller: ControllerConfig,
    pub placement: PlacementConfig,
    pub cluster: ClusterConfig,
    pub features: FeatureFlags,
    pub rollout: RolloutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Full resync of every placement and update run.
    pub resync_period_secs: u64,
    pub hub_qps: f64,
    pub hub_burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_period_secs: 6 * 60 * 60,
            hub_qps: 250.0,
            hub_burst: 1000,
        }
    }
}

impl ControllerConfig {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Worker count for scheduling cycles.
    pub max_concurrent_cluster_placement: usize,
    pub max_fleet_size: usize,
    pub concurrent_resource_change_syncs: usize,
    pub resource_snapshot_creation_minimum_interval_secs: u64,
    pub resource_changes_collection_duration_secs: u64,
    /// Accepted for compatibility; has no effect.
    pub work_pending_grace_period_secs: Option<u64>,
    pub rate_limiter: RateLimitConfig,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_concurrent_cluster_placement: 100,
            max_fleet_size: 100,
            concurrent_resource_change_syncs: 20,
            resource_snapshot_creation_minimum_interval_secs: 30,
            resource_changes_collection_duration_secs: 15,
            work_pending_grace_period_secs: None,
            rate_limiter: RateLimitConfig::default(),
        }
    }
}

/// Work-queue backoff: per-item exponential delay combined with a shared
/// token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub qps: f64,
    pub bucket_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 60_000,
            qps: 10.0,
            bucket_size: 100,
        }
    }
}

impl RateLimitConfig {
    /// Replace non-positive values with the defaults.
    pub fn effective(&self) -> Self {
        let d = Self::default();
        Self {
            base_delay_ms: if self.base_delay_ms == 0 { d.base_delay_ms } else { self.base_delay_ms },
            max_delay_ms: if self.max_delay_ms == 0 { d.max_delay_ms } else { self.max_delay_ms },
            qps: if self.qps > 0.0 { self.qps } else { d.qps },
            bucket_size: if self.bucket_size == 0 { d.bucket_size } else { self.bucket_size },
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// A cluster whose last heartbeat is older than this is not scheduled onto.
    pub unhealthy_threshold_secs: u64,
    pub force_delete_wait_time_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold_secs: 60,
            force_delete_wait_time_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_staged_update_run_apis: bool,
    pub enable_resource_placement_apis: bool,
    pub enable_eviction_apis: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_staged_update_run_apis: true,
            enable_resource_placement_apis: true,
            enable_eviction_apis: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Worker count for update-run reconciliation.
    pub max_concurrent_update_runs: usize,
    /// Concurrent cluster updates per stage when the stage sets no limit.
    pub default_stage_max_concurrency: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_concurrent_update_runs: 10,
            default_stage_max_concurrency: 5,
        }
    }
}

impl HubConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: HubConfig = toml::from_str(content)?;
        config.warn_deprecated();
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn warn_deprecated(&self) {
        if let Some(secs) = self.placement.work_pending_grace_period_secs {
            warn!(
                secs,
                "work_pending_grace_period_secs is deprecated and has no effect"
            );
        }
    }
}
