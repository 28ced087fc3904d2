//! What a failed cluster update does to the rest of the run.

use fleet_state::UpdateRun;

/// Effect of one failed cluster update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Fail the stage and the run; nothing else is dispatched.
    AbortRun,
    /// Record the failure as tolerated and keep going.
    Continue,
}

pub trait FailurePolicy: Send + Sync {
    fn name(&self) -> &str;

    fn on_task_failure(&self, run: &UpdateRun, stage: &str, cluster: &str, error: &str) -> FailureAction;
}

/// Any failure fails the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnFailure;

impl FailurePolicy for AbortOnFailure {
    fn name(&self) -> &str {
        "AbortOnFailure"
    }

    fn on_task_failure(&self, _: &UpdateRun, _: &str, _: &str, _: &str) -> FailureAction {
        FailureAction::AbortRun
    }
}

/// Failures are tolerated; stages complete once every task is terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOnFailure;

impl FailurePolicy for ContinueOnFailure {
    fn name(&self) -> &str {
        "ContinueOnFailure"
    }

    fn on_task_failure(&self, _: &UpdateRun, _: &str, _: &str, _: &str) -> FailureAction {
        FailureAction::Continue
    }
}
