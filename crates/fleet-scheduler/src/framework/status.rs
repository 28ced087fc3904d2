//! Plugin call outcomes.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Result category of a plugin call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    /// The plugin opts out. From PreFilter: its Filter/Score are not called
    /// for the rest of the cycle. From Filter: counts as a pass.
    Skip,
    /// The cluster is not eligible. Not an error.
    ClusterUnschedulable,
    /// The plugin could not evaluate; the cycle is aborted.
    InternalError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Skip => "Skip",
            Self::ClusterUnschedulable => "ClusterUnschedulable",
            Self::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one plugin call: code, reporting plugin, reason and an optional
/// wrapped cause (only for [`StatusCode::InternalError`]).
#[derive(Clone)]
pub struct Status {
    code: StatusCode,
    plugin: String,
    reason: String,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            plugin: String::new(),
            reason: String::new(),
            cause: None,
        }
    }

    /// A status without a wrapped error.
    pub fn non_error(code: StatusCode, plugin: &str, reason: impl Into<String>) -> Self {
        Self {
            code,
            plugin: plugin.to_string(),
            reason: reason.into(),
            cause: None,
        }
    }

    /// An [`StatusCode::InternalError`] wrapping `cause`.
    pub fn from_error(plugin: &str, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        let cause: Arc<dyn StdError + Send + Sync> = Arc::from(cause.into());
        Self {
            code: StatusCode::InternalError,
            plugin: plugin.to_string(),
            reason: cause.to_string(),
            cause: Some(cause),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync)> {
        self.cause.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    pub fn is_skip(&self) -> bool {
        self.code == StatusCode::Skip
    }

    pub fn is_cluster_unschedulable(&self) -> bool {
        self.code == StatusCode::ClusterUnschedulable
    }

    pub fn is_internal_error(&self) -> bool {
        self.code == StatusCode::InternalError
    }

    /// `"{plugin}: {reason}"`, or just the reason when no plugin is attached.
    pub fn message(&self) -> String {
        if self.plugin.is_empty() {
            self.reason.clone()
        } else {
            format!("{}: {}", self.plugin, self.reason)
        }
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.plugin == other.plugin
            && self.reason == other.reason
            && self.cause.as_ref().map(|c| c.to_string())
                == other.cause.as_ref().map(|c| c.to_string())
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("plugin", &self.plugin)
            .field("reason", &self.reason)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_has_no_plugin() {
        let s = Status::success();
        assert!(s.is_success());
        assert_eq!(s.message(), "");
        assert!(s.cause().is_none());
    }

    #[test]
    fn non_error_status_carries_reason() {
        let s = Status::non_error(StatusCode::ClusterUnschedulable, "P", "no room");
        assert!(s.is_cluster_unschedulable());
        assert_eq!(s.plugin_name(), "P");
        assert_eq!(s.message(), "P: no room");
        assert_eq!(s.to_string(), "ClusterUnschedulable: P: no room");
    }

    #[test]
    fn error_status_wraps_cause() {
        let s = Status::from_error("P", "lookup failed");
        assert!(s.is_internal_error());
        assert_eq!(s.cause().map(|c| c.to_string()).as_deref(), Some("lookup failed"));
        assert_eq!(s.reason(), "lookup failed");
    }

    #[test]
    fn equality_compares_cause_text() {
        assert_eq!(Status::from_error("P", "x"), Status::from_error("P", "x"));
        assert_ne!(Status::from_error("P", "x"), Status::from_error("P", "y"));
        assert_ne!(
            Status::non_error(StatusCode::Skip, "P", "r"),
            Status::non_error(StatusCode::Skip, "Q", "r")
        );
    }
}
