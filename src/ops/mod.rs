//! Operations and observability.
//!
//! - `metrics` - Aggregate recovery counters
//! - `telemetry` - Logging bootstrap

pub mod metrics;
pub mod telemetry;

pub use metrics::*;
pub use telemetry::*;
