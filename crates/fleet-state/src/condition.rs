//! Generation-stamped status conditions.
//!
//! A condition is authoritative only when its `observed_generation` matches
//! the generation of the object that carries it. Readers use
//! [`is_condition_true`] / [`find_current_condition`] so stale entries left
//! over from an earlier generation are never acted on.

use serde::{Deserialize, Serialize};

/// Tri-state status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed status entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: i64,
    /// Unix timestamp (seconds) of the last status flip.
    pub last_transition_time: u64,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        observed_generation: i64,
        now: u64,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation,
            last_transition_time: now,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Find a condition by type regardless of its generation.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Find a condition by type, only if it was observed at `generation`.
pub fn find_current_condition<'a>(
    conditions: &'a [Condition],
    type_: &str,
    generation: i64,
) -> Option<&'a Condition> {
    find_condition(conditions, type_).filter(|c| c.observed_generation == generation)
}

/// True when the condition exists, is `True`, and was observed at `generation`.
pub fn is_condition_true(cond: Option<&Condition>, generation: i64) -> bool {
    cond.is_some_and(|c| c.is_true() && c.observed_generation == generation)
}

/// Insert or update a condition.
///
/// The transition time only moves when the status flips; reason, message and
/// observed generation are always refreshed. Returns true if anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            let before = existing.clone();
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
            *existing != before
        }
        None => {
            conditions.push(new);
            true
        }
    }
}

/// Remove a condition by type. Returns true if it was present.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(status: ConditionStatus, generation: i64, at: u64) -> Condition {
        Condition::new("Ready", status, "Because", "msg", generation, at)
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conds = vec![cond(ConditionStatus::True, 1, 100)];
        let changed = set_condition(&mut conds, cond(ConditionStatus::True, 1, 200));
        assert!(!changed);
        assert_eq!(conds[0].last_transition_time, 100);
    }

    #[test]
    fn set_condition_moves_transition_time_on_flip() {
        let mut conds = vec![cond(ConditionStatus::True, 1, 100)];
        assert!(set_condition(&mut conds, cond(ConditionStatus::False, 2, 200)));
        assert_eq!(conds[0].last_transition_time, 200);
        assert_eq!(conds[0].observed_generation, 2);
    }

    #[test]
    fn stale_condition_is_not_trusted() {
        let conds = vec![cond(ConditionStatus::True, 1, 100)];
        assert!(is_condition_true(find_condition(&conds, "Ready"), 1));
        assert!(!is_condition_true(find_condition(&conds, "Ready"), 2));
        assert!(find_current_condition(&conds, "Ready", 2).is_none());
    }

    #[test]
    fn false_condition_is_not_true() {
        let conds = vec![cond(ConditionStatus::False, 1, 100)];
        assert!(!is_condition_true(find_condition(&conds, "Ready"), 1));
        assert!(!is_condition_true(None, 1));
    }

    #[test]
    fn remove_condition_reports_presence() {
        let mut conds = vec![cond(ConditionStatus::True, 1, 100)];
        assert!(remove_condition(&mut conds, "Ready"));
        assert!(!remove_condition(&mut conds, "Ready"));
    }
}
