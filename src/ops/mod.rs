//! Operations and observability.
//!
//! - `telemetry` - Logging initialization

pub mod telemetry;

pub use telemetry::*;
