//! Staged update run types and their state machines.
//!
//! Runs, stages and tasks each carry an explicit phase enum. Phases only move
//! through the guarded `transition` methods below, which also stamp the
//! matching generation-scoped conditions so readers and metric emitters see a
//! consistent picture.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::{Condition, ConditionStatus, find_current_condition, set_condition};
use crate::types::ObjectKey;

// Run condition types.
pub const RUN_INITIALIZED_CONDITION: &str = "Initialized";
pub const RUN_PROGRESSING_CONDITION: &str = "Progressing";
pub const RUN_SUCCEEDED_CONDITION: &str = "Succeeded";

// Stage condition types.
pub const STAGE_PROGRESSING_CONDITION: &str = "Progressing";
pub const STAGE_SUCCEEDED_CONDITION: &str = "Succeeded";

// Task condition types.
pub const TASK_APPROVAL_REQUEST_CREATED_CONDITION: &str = "ApprovalRequestCreated";
pub const TASK_APPROVAL_REQUEST_APPROVED_CONDITION: &str = "ApprovalRequestApproved";
pub const TASK_STARTED_CONDITION: &str = "Started";
pub const TASK_SUCCEEDED_CONDITION: &str = "Succeeded";

// Condition reasons.
pub const REASON_INITIALIZED: &str = "UpdateRunInitializedSuccessfully";
pub const REASON_INITIALIZATION_FAILED: &str = "UpdateRunInitializedFailed";
pub const REASON_STARTED: &str = "UpdateRunStarted";
pub const REASON_STOPPED: &str = "UpdateRunStopped";
pub const REASON_SUCCEEDED: &str = "UpdateRunSucceeded";
pub const REASON_FAILED: &str = "UpdateRunFailed";
pub const REASON_STAGE_STARTED: &str = "StageUpdatingStarted";
pub const REASON_STAGE_SUCCEEDED: &str = "StageUpdatingSucceeded";
pub const REASON_STAGE_FAILED: &str = "StageUpdatingFailed";
pub const REASON_APPROVAL_REQUESTED: &str = "ApprovalRequestCreated";
pub const REASON_APPROVED: &str = "ApprovalRequestApproved";
pub const REASON_CLUSTER_UPDATING: &str = "ClusterUpdatingStarted";
pub const REASON_CLUSTER_SUCCEEDED: &str = "ClusterUpdatingSucceeded";
pub const REASON_CLUSTER_FAILED: &str = "ClusterUpdatingFailed";
pub const REASON_CLUSTER_SKIPPED: &str = "ClusterUpdatingSkipped";

/// Rejected phase change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} transition from {from} to {to}")]
pub struct InvalidTransition {
    pub kind: &'static str,
    pub from: String,
    pub to: String,
}

// ── Spec ──────────────────────────────────────────────────────────

/// What the operator asks the run to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunRequestState {
    /// Compute the stage plan and wait.
    Initialize,
    /// Progress through the stages.
    #[default]
    Run,
    /// Stop dispatching new cluster updates.
    Stop,
}

impl RunRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::Run => "Run",
            Self::Stop => "Stop",
        }
    }
}

/// An operator-declared stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Clusters whose labels contain all of these pairs belong to this stage.
    #[serde(default)]
    pub cluster_labels: BTreeMap<String, String>,
    /// Every cluster update in this stage waits for an approval first.
    #[serde(default)]
    pub requires_approval: bool,
    /// Per-stage cap on concurrently updating clusters.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRunSpec {
    pub placement_name: String,
    #[serde(default)]
    pub state: RunRequestState,
    pub stages: Vec<StageDefinition>,
}

// ── Run ───────────────────────────────────────────────────────────

/// A staged rollout request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRun {
    pub namespace: Option<String>,
    pub name: String,
    pub generation: i64,
    pub spec: UpdateRunSpec,
    #[serde(default)]
    pub status: UpdateRunStatus,
    #[serde(default)]
    pub deletion_timestamp: Option<u64>,
    #[serde(default)]
    pub resource_version: u64,
}

impl UpdateRun {
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// The most specific condition observed at the current generation,
    /// checked in the order Succeeded, Progressing, Initialized.
    pub fn reported_condition(&self) -> Option<&Condition> {
        [
            RUN_SUCCEEDED_CONDITION,
            RUN_PROGRESSING_CONDITION,
            RUN_INITIALIZED_CONDITION,
        ]
        .into_iter()
        .find_map(|t| find_current_condition(&self.status.conditions, t, self.generation))
    }

    /// Move the run to `to`, stamping the run-level conditions.
    pub fn transition(&mut self, to: RunPhase, message: &str, now: u64) -> Result<(), InvalidTransition> {
        let from = self.status.phase;
        if !RunPhase::can_transition(from, to) {
            return Err(InvalidTransition {
                kind: "update run",
                from: from.map_or("None".to_string(), |p| format!("{p:?}")),
                to: format!("{to:?}"),
            });
        }
        let generation = self.generation;
        let conds = &mut self.status.conditions;
        let mut set = |t: &str, status, reason: &str| {
            set_condition(conds, Condition::new(t, status, reason, message, generation, now));
        };
        match (from, to) {
            (_, RunPhase::Initialized) => {
                set(RUN_INITIALIZED_CONDITION, ConditionStatus::True, REASON_INITIALIZED);
            }
            (None, RunPhase::Failed) => {
                set(RUN_INITIALIZED_CONDITION, ConditionStatus::False, REASON_INITIALIZATION_FAILED);
            }
            (_, RunPhase::Progressing) => {
                set(RUN_PROGRESSING_CONDITION, ConditionStatus::True, REASON_STARTED);
            }
            (_, RunPhase::Succeeded) => {
                set(RUN_PROGRESSING_CONDITION, ConditionStatus::False, REASON_SUCCEEDED);
                set(RUN_SUCCEEDED_CONDITION, ConditionStatus::True, REASON_SUCCEEDED);
            }
            (_, RunPhase::Failed) => {
                set(RUN_PROGRESSING_CONDITION, ConditionStatus::False, REASON_FAILED);
                set(RUN_SUCCEEDED_CONDITION, ConditionStatus::False, REASON_FAILED);
            }
        }
        self.status.phase = Some(to);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateRunStatus {
    /// `None` until the run has been initialized.
    pub phase: Option<RunPhase>,
    /// Snapshot whose bindings the stage plan was computed from.
    #[serde(default)]
    pub policy_snapshot_name: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Top-level run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Initialized,
    Progressing,
    Succeeded,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Allowed moves: (none) → Initialized | Failed, Initialized → Progressing | Failed,
    /// Progressing → Succeeded | Failed. Terminal phases never move.
    pub fn can_transition(from: Option<RunPhase>, to: RunPhase) -> bool {
        matches!(
            (from, to),
            (None, RunPhase::Initialized | RunPhase::Failed)
                | (Some(RunPhase::Initialized), RunPhase::Progressing | RunPhase::Failed)
                | (Some(RunPhase::Progressing), RunPhase::Succeeded | RunPhase::Failed)
        )
    }
}

// ── Stage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StagePhase {
    Pending,
    Progressing,
    Succeeded,
    Failed,
}

impl StagePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition(self, to: StagePhase) -> bool {
        matches!(
            (self, to),
            (StagePhase::Pending, StagePhase::Progressing)
                | (StagePhase::Progressing, StagePhase::Succeeded | StagePhase::Failed)
        )
    }
}

/// Progress of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub name: String,
    pub phase: StagePhase,
    pub tasks: Vec<StageTaskStatus>,
    /// Unix timestamp (seconds) at which the stage started updating clusters.
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl StageStatus {
    pub fn new(name: &str, tasks: Vec<StageTaskStatus>) -> Self {
        Self {
            name: name.to_string(),
            phase: StagePhase::Pending,
            tasks,
            start_time: None,
            end_time: None,
            conditions: Vec::new(),
        }
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.phase.is_terminal())
    }

    pub fn task_mut(&mut self, cluster_name: &str) -> Option<&mut StageTaskStatus> {
        self.tasks.iter_mut().find(|t| t.cluster_name == cluster_name)
    }

    pub fn transition(
        &mut self,
        to: StagePhase,
        generation: i64,
        now: u64,
    ) -> Result<(), InvalidTransition> {
        if !self.phase.can_transition(to) {
            return Err(InvalidTransition {
                kind: "stage",
                from: format!("{:?}", self.phase),
                to: format!("{to:?}"),
            });
        }
        let name = self.name.clone();
        let conds = &mut self.conditions;
        let mut set = |t: &str, status, reason: &str| {
            let msg = format!("stage {name}: {reason}");
            set_condition(conds, Condition::new(t, status, reason, msg, generation, now));
        };
        match to {
            StagePhase::Progressing => {
                self.start_time = Some(now);
                set(STAGE_PROGRESSING_CONDITION, ConditionStatus::True, REASON_STAGE_STARTED);
            }
            StagePhase::Succeeded => {
                self.end_time = Some(now);
                set(STAGE_PROGRESSING_CONDITION, ConditionStatus::False, REASON_STAGE_SUCCEEDED);
                set(STAGE_SUCCEEDED_CONDITION, ConditionStatus::True, REASON_STAGE_SUCCEEDED);
            }
            StagePhase::Failed => {
                self.end_time = Some(now);
                set(STAGE_PROGRESSING_CONDITION, ConditionStatus::False, REASON_STAGE_FAILED);
                set(STAGE_SUCCEEDED_CONDITION, ConditionStatus::False, REASON_STAGE_FAILED);
            }
            StagePhase::Pending => {}
        }
        self.phase = to;
        Ok(())
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// Lifecycle of one cluster update inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPhase {
    Pending,
    ApprovalRequestCreated,
    ApprovalRequestApproved,
    Updating,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn can_transition(self, to: TaskPhase) -> bool {
        use TaskPhase::*;
        matches!(
            (self, to),
            (Pending, ApprovalRequestCreated | Updating | Skipped)
                | (ApprovalRequestCreated, ApprovalRequestApproved | Skipped)
                | (ApprovalRequestApproved, Updating | Skipped)
                | (Updating, Succeeded | Failed)
        )
    }
}

/// One cluster's unit of work within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTaskStatus {
    pub cluster_name: String,
    pub requires_approval: bool,
    pub phase: TaskPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Set when a failure was accepted by the run's failure policy.
    #[serde(default)]
    pub failure_tolerated: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl StageTaskStatus {
    pub fn new(cluster_name: &str, requires_approval: bool) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            requires_approval,
            phase: TaskPhase::Pending,
            conditions: Vec::new(),
            failure_tolerated: false,
            message: None,
        }
    }

    /// Cleared to dispatch: no gate, or the gate has been approved.
    pub fn is_ready(&self) -> bool {
        match self.phase {
            TaskPhase::Pending => !self.requires_approval,
            TaskPhase::ApprovalRequestApproved => true,
            _ => false,
        }
    }

    pub fn transition(
        &mut self,
        to: TaskPhase,
        message: &str,
        generation: i64,
        now: u64,
    ) -> Result<(), InvalidTransition> {
        if !self.phase.can_transition(to) {
            return Err(InvalidTransition {
                kind: "stage task",
                from: format!("{:?}", self.phase),
                to: format!("{to:?}"),
            });
        }
        let conds = &mut self.conditions;
        let mut set = |t: &str, status, reason: &str| {
            set_condition(conds, Condition::new(t, status, reason, message, generation, now));
        };
        match to {
            TaskPhase::ApprovalRequestCreated => {
                set(TASK_APPROVAL_REQUEST_CREATED_CONDITION, ConditionStatus::True, REASON_APPROVAL_REQUESTED);
            }
            TaskPhase::ApprovalRequestApproved => {
                set(TASK_APPROVAL_REQUEST_APPROVED_CONDITION, ConditionStatus::True, REASON_APPROVED);
            }
            TaskPhase::Updating => {
                set(TASK_STARTED_CONDITION, ConditionStatus::True, REASON_CLUSTER_UPDATING);
            }
            TaskPhase::Succeeded => {
                set(TASK_SUCCEEDED_CONDITION, ConditionStatus::True, REASON_CLUSTER_SUCCEEDED);
            }
            TaskPhase::Failed => {
                set(TASK_SUCCEEDED_CONDITION, ConditionStatus::False, REASON_CLUSTER_FAILED);
            }
            TaskPhase::Skipped => {
                set(TASK_SUCCEEDED_CONDITION, ConditionStatus::False, REASON_CLUSTER_SKIPPED);
            }
            TaskPhase::Pending => {}
        }
        if !message.is_empty() {
            self.message = Some(message.to_string());
        }
        self.phase = to;
        Ok(())
    }
}
