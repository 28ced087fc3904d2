//! Scheduling profiles: an ordered plugin list.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{FrameworkError, FrameworkResult};
use crate::framework::plugin::Plugin;
use crate::plugins::{ClusterAffinity, NamespaceAffinity};

pub const DEFAULT_PROFILE_NAME: &str = "DefaultProfile";

/// Plugins in registration order. Order decides which rejection is reported
/// when several plugins reject the same cluster.
#[derive(Clone)]
pub struct Profile {
    name: String,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Profile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// ClusterAffinity, then NamespaceAffinity.
    pub fn default_profile() -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_string(),
            plugins: vec![
                Arc::new(ClusterAffinity::new()),
                Arc::new(NamespaceAffinity::new()),
            ],
        }
    }
}

pub struct ProfileBuilder {
    name: String,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl ProfileBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            plugins: Vec::new(),
        }
    }

    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn with_shared_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Plugin names must be unique within a profile.
    pub fn build(self) -> FrameworkResult<Profile> {
        let mut seen = HashSet::new();
        for p in &self.plugins {
            if !seen.insert(p.name().to_string()) {
                return Err(FrameworkError::DuplicatePlugin(p.name().to_string()));
            }
        }
        Ok(Profile {
            name: self.name,
            plugins: self.plugins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_order() {
        let profile = Profile::default_profile();
        let names: Vec<&str> = profile.plugins().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["ClusterAffinity", "NamespaceAffinity"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = ProfileBuilder::new("p")
            .with_plugin(NamespaceAffinity::new())
            .with_plugin(NamespaceAffinity::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FrameworkError::DuplicatePlugin(n) if n == "NamespaceAffinity"));
    }

    #[test]
    fn renamed_plugins_coexist() {
        let profile = ProfileBuilder::new("p")
            .with_plugin(NamespaceAffinity::new())
            .with_plugin(NamespaceAffinity::with_name("NamespaceAffinity2"))
            .build()
            .unwrap();
        assert_eq!(profile.plugins().len(), 2);
        assert_eq!(profile.name(), "p");
    }
}
