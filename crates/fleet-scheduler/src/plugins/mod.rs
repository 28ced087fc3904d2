//! Built-in scheduler plugins.

pub mod cluster_affinity;
pub mod namespace_affinity;

pub use cluster_affinity::ClusterAffinity;
pub use namespace_affinity::NamespaceAffinity;
