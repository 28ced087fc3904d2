//! Plugin capabilities and the per-call context.
//!
//! A plugin implements [`Plugin`] plus any of the extension-point traits and
//! advertises them through the `as_*` probes. The framework only calls an
//! extension point the plugin advertises.

use std::time::Duration;

use fleet_state::{ClusterScore, MemberCluster, PolicySnapshot};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::FrameworkError;
use crate::framework::cycle_state::CycleState;
use crate::framework::status::Status;

/// Cancellation and deadline for one scheduling cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl CycleContext {
    /// No deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    /// Cancel when `rx` observes `true` (shares the daemon's shutdown signal).
    pub fn with_cancellation(mut self, rx: watch::Receiver<bool>) -> Self {
        self.cancel = Some(rx);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast when the cycle should stop.
    pub fn check(&self) -> Result<(), FrameworkError> {
        if self.is_cancelled() {
            return Err(FrameworkError::Cancelled);
        }
        if self.is_deadline_exceeded() {
            return Err(FrameworkError::DeadlineExceeded);
        }
        Ok(())
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        None
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        None
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        None
    }
}

/// Runs once per cycle, before any Filter call.
///
/// Returning Skip opts the plugin out of Filter and Score for the cycle.
/// Anything other than Success or Skip aborts the cycle.
pub trait PreFilterPlugin: Plugin {
    fn pre_filter(
        &self,
        ctx: &CycleContext,
        state: &mut CycleState,
        snapshot: &PolicySnapshot,
    ) -> Status;
}

/// Runs once per candidate cluster. Must not mutate anything.
pub trait FilterPlugin: Plugin {
    fn filter(
        &self,
        ctx: &CycleContext,
        state: &CycleState,
        snapshot: &PolicySnapshot,
        cluster: &MemberCluster,
    ) -> Status;
}

/// Runs once per feasible cluster; scores are summed across plugins.
pub trait ScorePlugin: Plugin {
    fn score(
        &self,
        ctx: &CycleContext,
        state: &CycleState,
        snapshot: &PolicySnapshot,
        cluster: &MemberCluster,
    ) -> Result<ClusterScore, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_context_never_stops() {
        let ctx = CycleContext::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn cancellation_is_observed() {
        let (tx, rx) = watch::channel(false);
        let ctx = CycleContext::background().with_cancellation(rx);
        assert!(ctx.check().is_ok());
        tx.send(true).unwrap();
        assert!(matches!(ctx.check(), Err(FrameworkError::Cancelled)));
    }

    #[tokio::test]
    async fn expired_deadline_is_observed() {
        let ctx = CycleContext::with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(FrameworkError::DeadlineExceeded)));
    }
}
