//! fleet-state — embedded state store for the fleet hub.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for placements, policy snapshots, member clusters, bindings and
//! staged update runs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{name}`, `{namespace}/{placement}:{cluster}`)
//! enable prefix scans for related records. Writes use optimistic
//! concurrency on a per-object `resource_version` and are announced on a
//! broadcast channel.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod condition;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod update_run;

pub use condition::*;
pub use error::{StateError, StateResult};
pub use store::{ObjectKind, StateStore, StoreEvent};
pub use types::*;
pub use update_run::*;
