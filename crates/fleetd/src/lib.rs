//! fleetd — the fleet hub daemon.
//!
//! Runs the placement scheduler and the update-run controller against one
//! state store. The binary in `main.rs` only parses flags, sets up logging
//! and hands over to [`Hub`].

pub mod hub;
pub mod routing;

pub use hub::{Hub, ROLLOUT_QUEUE, SCHEDULER_QUEUE};
pub use routing::{Route, route_event};
