//! fleet-metrics — observability for the fleet hub.
//!
//! Label-vector gauges and histograms with partial-match deletion, the hub's
//! metric families, and Prometheus-compatible text exposition.
//!
//! # Architecture
//!
//! ```text
//! HubMetrics (process-wide, initialized once; injectable in tests)
//!   ├── placement / update-run status gauges
//!   ├── approval latency + stage duration histograms
//!   ├── scheduling cycle histogram + active workers gauge
//!   └── eviction completion gauge
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for a /metrics endpoint
//! ```

pub mod hub;
pub mod prometheus;
pub mod vec;

pub use hub::{HubMetrics, bool_label, epoch_secs};
pub use prometheus::render_prometheus;
pub use vec::{GaugeVec, HistogramVec};
