//! Scheduler error types.

use thiserror::Error;

use crate::framework::status::Status;

/// Errors raised while running plugins.
#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("plugin {plugin} failed at {extension_point}: {status}")]
    PluginFailed {
        plugin: String,
        extension_point: &'static str,
        status: Status,
    },

    #[error("duplicate plugin name in profile: {0}")]
    DuplicatePlugin(String),

    #[error("scheduling cycle cancelled")]
    Cancelled,

    #[error("scheduling cycle deadline exceeded")]
    DeadlineExceeded,
}

pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors that can occur during a scheduling cycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("framework error: {0}")]
    Framework(#[from] FrameworkError),

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("binding {binding} kept conflicting after {attempts} attempts")]
    BindingConflict { binding: String, attempts: u32 },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
