pub mod config;

pub use config::{
    ClusterConfig, ControllerConfig, FeatureFlags, HubConfig, PlacementConfig, RateLimitConfig,
    RolloutConfig,
};
