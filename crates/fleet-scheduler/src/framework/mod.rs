//! Scheduling framework: plugin capabilities, per-cycle state and the runner
//! that drives a profile's plugins over the candidate clusters.

pub mod cycle_state;
pub mod plugin;
pub mod profile;
pub mod runner;
pub mod status;

pub use cycle_state::CycleState;
pub use plugin::{CycleContext, FilterPlugin, Plugin, PreFilterPlugin, ScorePlugin};
pub use profile::{Profile, ProfileBuilder};
pub use runner::{Evaluation, Framework, ScoredCluster};
pub use status::{Status, StatusCode};
