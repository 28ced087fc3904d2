//! Per-cycle scratch state.
//!
//! A `CycleState` is created for exactly one scheduling cycle and dropped at
//! its end. PreFilter plugins get `&mut` access and may stash values under a
//! key of their choosing (conventionally their own name); Filter and Score
//! plugins only get `&`, so they cannot mutate it.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use fleet_state::MemberCluster;

pub struct CycleState {
    store: HashMap<String, Box<dyn Any + Send + Sync>>,
    clusters: Vec<MemberCluster>,
    scheduled_or_bound: HashSet<String>,
}

impl CycleState {
    /// `clusters` are this cycle's candidates; `scheduled_or_bound` names the
    /// clusters that already carry a scheduled or bound binding.
    pub fn new(clusters: Vec<MemberCluster>, scheduled_or_bound: HashSet<String>) -> Self {
        Self {
            store: HashMap::new(),
            clusters,
            scheduled_or_bound,
        }
    }

    pub fn write<T: Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.store.insert(key.to_string(), Box::new(value));
    }

    /// `None` if the key is absent or holds a different type.
    pub fn read<T: Any>(&self, key: &str) -> Option<&T> {
        self.store.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    pub fn list_clusters(&self) -> &[MemberCluster] {
        &self.clusters
    }

    pub fn is_cluster_scheduled_or_bound(&self, name: &str) -> bool {
        self.scheduled_or_bound.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_read_write() {
        let mut state = CycleState::new(vec![], HashSet::new());
        state.write("plugin-a", 42u32);
        assert_eq!(state.read::<u32>("plugin-a"), Some(&42));
        // Wrong type reads as absent.
        assert_eq!(state.read::<String>("plugin-a"), None);
        assert!(state.delete("plugin-a"));
        assert!(!state.delete("plugin-a"));
    }

    #[test]
    fn scheduled_or_bound_lookup() {
        let state = CycleState::new(vec![], HashSet::from(["member-1".to_string()]));
        assert!(state.is_cluster_scheduled_or_bound("member-1"));
        assert!(!state.is_cluster_scheduled_or_bound("member-2"));
        assert!(state.list_clusters().is_empty());
    }
}
