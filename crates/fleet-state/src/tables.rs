//! redb table definitions for the fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Namespaced objects are keyed `{namespace}/{name}`; cluster-scoped objects use
//! an empty namespace segment (`/{name}`). Bindings are keyed
//! `{namespace}/{placement}:{cluster}` so they can be prefix-scanned per placement.

use redb::TableDefinition;

/// Table definition shape shared by every object table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Placements keyed by `{namespace}/{name}`.
pub const PLACEMENTS: JsonTable = TableDefinition::new("placements");

/// Policy snapshots keyed by `{namespace}/{placement}-{index}`.
pub const POLICY_SNAPSHOTS: JsonTable = TableDefinition::new("policy_snapshots");

/// Member clusters keyed by `{name}`.
pub const MEMBER_CLUSTERS: JsonTable = TableDefinition::new("member_clusters");

/// Bindings keyed by `{namespace}/{placement}:{cluster}`.
pub const BINDINGS: JsonTable = TableDefinition::new("bindings");

/// Update runs keyed by `{namespace}/{name}`.
pub const UPDATE_RUNS: JsonTable = TableDefinition::new("update_runs");
