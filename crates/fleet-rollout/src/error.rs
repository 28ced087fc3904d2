//! Rollout error types.

use fleet_state::{InvalidTransition, StateError, TaskPhase};
use thiserror::Error;

use crate::plan::PlanError;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("stage plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("update run {0} not found")]
    RunNotFound(String),

    #[error("no task for cluster {cluster} in stage {stage}")]
    TaskNotFound { stage: String, cluster: String },

    #[error("task for cluster {cluster} is {phase:?}, not waiting for approval")]
    NotAwaitingApproval { cluster: String, phase: TaskPhase },
}

pub type RolloutResult<T> = Result<T, RolloutError>;
